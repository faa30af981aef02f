pub mod executor;
pub mod extract;
pub mod headers;
pub mod outcome;

// Re-export common types
pub use executor::FetchExecutor;
pub use extract::{extract, ExtractedData};
pub use headers::HeaderGenerator;
pub use outcome::FetchOutcome;
