pub mod document;
pub mod duration;
pub mod hash;
pub mod recurrence;
pub mod task_parser;
pub mod task_serializer;

pub use document::{LocalCorpus, ParsedDocument, SectionRegion};
pub use hash::snapshot_hash;
pub use task_parser::{TaskLine, parse_task_line, parse_tasks, parse_title_and_tags};
pub use task_serializer::{format_task_block, format_task_line, format_task_tree};
