pub mod driver;
pub mod k8s;
