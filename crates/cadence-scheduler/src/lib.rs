//! `cadence-scheduler`: persistent, in-process repeating job scheduler.
//!
//! # Overview
//!
//! Jobs are named node trees carrying a script body and a repetition policy.
//! The [`engine::TaskScheduler`] keeps them in memory, sleeps until the
//! soonest one is due, hands its script to a [`executor::ScriptExecutor`],
//! rearms it and writes the whole set back through a [`store::JobStore`].
//!
//! # Repetition policies
//!
//! | Policy     | Behaviour                                             |
//! |------------|-------------------------------------------------------|
//! | `Interval` | Repeat every N seconds, minutes, hours or days        |
//! | `Weekday`  | Fire at HH:MM UTC on a specific weekday               |
//!
//! # Stores
//!
//! | Store       | Layout                                               |
//! |-------------|------------------------------------------------------|
//! | `File`      | One JSON array of job nodes, replaced atomically     |
//! | `Directory` | One JSON file per job                                |
//! | `Sqlite`    | `jobs` table, replaced in a single transaction       |
//! | `Memory`    | Volatile, for tests and embedders                    |

pub mod engine;
pub mod error;
pub mod executor;
pub mod job;
pub mod schedule;
pub mod store;

pub use engine::{SchedulerEvent, TaskScheduler};
pub use error::{Result, SchedulerError};
pub use executor::ScriptExecutor;
pub use job::{Job, JobSummary, SCRIPT_NODE};
pub use schedule::{IntervalRepetition, IntervalUnit, Repetition, WeekdayRepetition};
pub use store::{
    open_store, DirectoryJobStore, FileJobStore, JobStore, MemoryJobStore, SqliteJobStore,
};
