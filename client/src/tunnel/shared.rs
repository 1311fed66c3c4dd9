use crate::backend::BackendError;

/// A tunnel device living in the operating system
pub trait OsTunnel {
    async fn setup(&mut self) -> Result<(), BackendError>;
    async fn destroy(&mut self) -> Result<(), BackendError>;
    fn get_interface_name(&self) -> &str;
    fn is_ift_created(&self) -> bool;
}
