#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

pub mod error;
pub mod executor;
pub mod progress;
pub mod run;

pub(crate) mod controllers;
pub(crate) mod limiter;
pub(crate) mod ramp;
pub(crate) mod state;
pub(crate) mod worker;

pub use error::LoadTestError;
pub use executor::{ExecutorError, ExecutorResult, RequestExecutor};
pub use progress::ProgressSink;
pub use run::LoadTest;

pub use stampede_core::{
    ExecutedRequest, LoadConfig, LoadTestMetrics, ProgressSnapshot, RequestTemplate,
};

pub mod prelude {
    pub use crate::executor::{ExecutorError, ExecutorResult};
    pub use crate::progress::ProgressSink;
    pub use crate::run::LoadTest;

    pub use stampede_core::{
        calculate_metrics, AdaptivePhase, AdaptiveSummary, ExecutedRequest, LoadConfig,
        LoadTestMetrics, ProgressSnapshot, RawLoadConfig, RequestTemplate,
    };
}
