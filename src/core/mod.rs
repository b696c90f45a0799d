//! Core bias-correction modules

pub mod correct;
pub mod despeckle;
pub mod masks;
pub mod metadata;
pub mod offset;
pub mod pair_table;
pub mod plot;
pub mod reference;
pub mod uncertainty;
pub mod velocity_stack;

// Re-export main types
pub use correct::{
    apply_correction, duplicate_products, product_id, CorrectedField, FieldCorrector, FieldOutcome, ProductPaths,
};
pub use despeckle::{nanmedian_stack, Despeckle, DespeckleParams};
pub use masks::{MaskBuilder, MaskPaths, MaskSet};
pub use metadata::FieldMetadata;
pub use offset::{OffsetBuilder, OffsetOutcome, OffsetPaths, OffsetTable, PairSkip};
pub use pair_table::{PairTable, VelocityFieldRecord};
pub use reference::{ReferenceBuilder, ReferenceField, ReferencePaths};
pub use uncertainty::{OffIceUncertainty, RockStatistics};
pub use velocity_stack::FieldLoader;
