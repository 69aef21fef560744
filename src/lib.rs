//! Cached orchestration of an external geometry tool and aerodynamic solver.
//!
//! A design point is reduced to a [`Fingerprint`]; if an equivalent one is
//! already stored in the [`ResultCache`] its coefficients are returned,
//! otherwise the [`Pipeline`] generates inputs from templates, runs both
//! tools and parses their output into a [`ResultRecord`] that is appended to
//! the cache.

pub mod cache;
pub mod config;
pub mod error;
pub mod evaluate;
pub mod fingerprint;
pub mod geometry;
pub mod io;
pub mod layout;
pub mod parser;
pub mod pipeline;
pub mod record;
pub mod runner;
pub mod template;

pub use cache::{CacheEntry, LockOwner, LockPolicy, ResultCache};
pub use error::{Error, Result};
pub use evaluate::{Evaluation, Evaluator};
pub use fingerprint::{Fingerprint, Flavor, ParameterBundle, TrailingField};
pub use geometry::Case;
pub use layout::{EngineLayout, Mounting};
pub use pipeline::{Pipeline, PipelineState, Settings, WorkDir};
pub use record::{Coefficient, ResultRecord};
pub use runner::{Invocation, ScriptRunner, ToolRunner};
pub use template::{Edit, Template, Value};
