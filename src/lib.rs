pub mod config;
pub mod extractor;
pub mod milter;
pub mod mime;
pub mod policy;
pub mod scanner;
pub mod session;

pub use config::Config;
pub use extractor::{extract, ExtractError, ExtractLimits, ExtractionResult, HeaderMap, MessageUnit};
pub use milter::Milter;
pub use policy::{PolicyContext, PolicyError, PolicyEvaluator};
pub use scanner::{ScanClient, ScanError, ScanFinding, Scanner, SubMatch};
pub use session::{Gateway, Outcome, QuarantineSink, QuarantineVerdict, Session};
