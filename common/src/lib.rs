pub mod error;
pub mod types;

pub mod utils {
    pub mod config;
    pub mod content_filter;
    pub mod embedding;
    pub mod generation;
}
