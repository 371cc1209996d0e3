pub mod acquisition;
pub mod analytics;
pub mod classification;
pub mod counting;
pub mod export;
pub mod preprocessing;
pub mod segmentation;
pub mod watershed;

pub use acquisition::{AcquisitionParams, AcquisitionStage, FrameDirectorySource, FrameRequest, FrameSource};
pub use analytics::AnalyticsStage;
pub use classification::{ClassificationStage, ProbabilityModel};
pub use counting::CountingStage;
pub use export::ExportStage;
pub use preprocessing::PreprocessingStage;
pub use segmentation::SegmentationStage;
