//! The capture core: Origin Gate → Extractor → Noise Filter & Session Tagger.

pub mod extract;
pub mod filter;
pub mod origin;
pub mod session;
pub mod transport;

pub use extract::{ extract, Extracted, Extractor, IncomingMessage };
pub use filter::{ filter_and_tag, NoiseFilter, NoiseRules };
pub use origin::OriginGate;
pub use session::{ CapturePipeline, EmbedProfile, EmbedSession, PersistOutcome, SessionState };
pub use transport::{ TransportMode, TransportSelector };
