pub mod cache;
pub mod classify;
pub mod identifiers;
pub mod kml;
pub mod merge;
pub mod normalize;
pub mod overrides;
pub mod pipeline;
pub mod sources;
