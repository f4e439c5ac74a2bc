pub mod app;
pub mod camera3d;
pub mod cli;
pub mod clusters;
pub mod config;
pub mod error;

pub use app::run;
pub use error::ClusterError;
