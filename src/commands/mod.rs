pub mod call_api;
pub mod signal_api;
pub mod util_api;

pub use call_api::CallController;
