// Work queue module

pub mod item;
pub mod store;

pub use item::{
    Episode, EpisodeStage, EpisodeTotals, ItemError, ItemSource, ItemStatus, Progress,
    SubtitleInfo, WorkItem,
};
pub use store::{ClearScope, QueueHealth, QueueStore, StopOutcome};
