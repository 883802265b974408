pub mod compositor;
pub mod config;
pub mod decoder;
pub mod error;
pub mod events;
pub mod index;
pub mod prefetch;
pub mod processing;
pub mod source;
pub mod surface;
pub mod text;
pub mod tasks {
    pub mod scheduler;
    pub mod session;
    pub mod viewer;
}
