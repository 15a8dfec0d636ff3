//! # Grainscan
//!
//! 3D granular-particle analysis for CT image stacks: stack a folder of
//! grayscale slices into a volume, binarize it with a two-stage Otsu
//! threshold, split touching grains with an erosion–watershed sweep, count
//! inter-particle contacts under a guard-volume filter, and select the
//! erosion radius that is both geometrically stable and physically
//! plausible.
//!
//! ## Pipeline
//!
//! ```text
//! folder of slices
//!   └─ loader    → integer volume (native bit depth)
//!       └─ binarize  → boolean volume + binarization info
//!           └─ sweep (for each radius r)
//!               ├─ split     → label volume
//!               ├─ metrics   → dominance/size statistics
//!               └─ contacts  → interior contact counts
//!           └─ select    → r* + reason
//!               └─ persist   → optimization_results.csv, labels_r{r*}.npy
//! ```
//!
//! The [`pipeline::run`] entry point drives the whole flow and reports
//! progress through a typed event stream; the individual stages are public
//! for callers that need only a piece of the machinery.

pub mod binarize;
pub mod contacts;
pub mod distance;
pub mod error;
pub mod loader;
pub mod metrics;
pub mod morphology;
pub mod pipeline;
pub mod report;
pub mod select;
pub mod split;
pub mod sweep;
pub mod volume;
pub mod watershed;

pub use binarize::{BinarizationInfo, BinarizeOptions, Polarity, RoiMode, ThresholdMethod};
pub use error::{Error, Result};
pub use morphology::Connectivity;
pub use pipeline::{
    CancelToken, NullSink, PipelineOptions, ProgressEvent, ProgressSink, Stage, run,
};
pub use select::{Selection, SelectorOptions, SelectorReason, SweepSummary};
pub use sweep::SweepRecord;
pub use volume::{GrayVolume, Volume, VolumeShape};
