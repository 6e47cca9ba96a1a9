#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod aggregate;
pub mod contingency;
pub mod genotype;
pub mod io;
pub mod labels;
pub mod pipeline;
pub mod plink_list;
pub mod segregation;
#[path = "../shared/files.rs"]
pub mod shared_files;
pub mod trend;
pub mod types;
pub mod shared {
    pub use super::shared_files as files;
}
