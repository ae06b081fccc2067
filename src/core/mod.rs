//! Core merge and compositing modules

pub mod quality_mask;
pub mod statistics;
pub mod warp;
pub mod rescale;
pub mod merge;
pub mod reconcile;
pub mod blend;
pub mod band_index;

// Re-export main types
pub use quality_mask::{
    extract_bits, extract_qa_bit, ConfidenceLevel, ConfidenceSpec, MaskClassification,
    QualityMaskSpec,
};
pub use statistics::{dataset_statistics, statistics, QualityStatistics};
pub use warp::{reproject, GridSpec, Resampling, TargetGrid, TileGeometry, TileGeometryLookup};
pub use rescale::{rescale, ScaleOverride};
pub use merge::{MergeEngine, MergeRequest, MergeResult, SourceAsset};
pub use reconcile::{ContributingBand, NodataReconciler};
pub use blend::{BlendActivity, BlendScene, CompositeFunction, CompositeOutput, TemporalCompositor};
pub use band_index::{generate_band_indexes, BandExpression, BandIndex};
