pub mod adapter;
pub mod process;
pub mod protocol;
pub mod stream_state;

pub use adapter::SessionAdapter;
pub use process::SidecarProcess;
