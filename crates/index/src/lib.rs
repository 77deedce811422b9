pub mod chunker;
pub mod debounce;
pub mod ingest;
pub mod parser;
pub mod queue;
pub mod scanner;
pub mod scheduler;
pub mod watcher;

pub use chunker::{Chunker, ChunkerConfig};
pub use debounce::{DebounceConfig, Debouncer};
pub use ingest::{IngestContext, IngestOutcome, needs_index};
pub use parser::{ParseError, ParserRegistry, ParserSpec};
pub use queue::{EmbedQueue, IngestionHandle, IngestionOutcome, QueueError, run_consumer};
pub use scanner::{PathFilter, ScannedFile, Scanner};
pub use scheduler::FileScheduler;
pub use watcher::{ChangeKind, FileChange, FileWatcher, WatchError, watch_loop};
