pub mod config;
pub mod device;
pub mod error;
pub mod imaging;
pub mod inference;
pub mod models;
pub mod pipeline;
pub mod styles;
pub mod trainers;

// Re-export common types
pub use config::{load_config, Config};
pub use error::{AdGenError, ErrorKind, ErrorReport, PipelineError};
pub use pipeline::{GenerationRequest, GenerationResult, Orchestrator, Stage};
pub use styles::{StyleProfile, StyleRegistry};
pub use trainers::{train, LoraAdapter, TrainingRun};

pub mod logging {
    use env_logger::{Builder, Env};
    use std::io::Write;

    /// Timestamped `info` logger, overridable through `RUST_LOG`
    pub fn init_logger() {
        Builder::from_env(Env::default().default_filter_or("info"))
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                )
            })
            .init();
    }

    /// Same format, but safe to call repeatedly from tests
    pub fn try_init_test_logger() {
        let _ = Builder::from_env(Env::default().default_filter_or("debug"))
            .is_test(true)
            .try_init();
    }
}
