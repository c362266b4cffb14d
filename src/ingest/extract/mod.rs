// VELIN Extraction - Lots chevauchants, extracteur, stitching
// Première moitié du pipeline : de la source opaque au markdown canonique

pub mod batch_planner;
pub mod extractor;
pub mod stitcher;

pub use batch_planner::{calculate_batch_ranges, ranges_cover, BatchConfig};
pub use extractor::{
    derive_raw_chunks, rebase_raw_chunks, run_extraction, BatchOutput, BatchResult,
    ExtractionOutcome, Extractor, ModelExtractor, ModelExtractorConfig,
};
pub use stitcher::{stitch, StitchConfig, StitchMethod, StitchReport, StitchedMarkdown};
