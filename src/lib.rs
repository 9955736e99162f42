//! foliodb - an embedded, transactional, ordered key/value storage engine.
//!
//! # Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           foliodb                               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │         Exchange (tree/)  - per-thread cursor            │   │
//! │  │        Key/Value codecs (encoding/) - typed keys         │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! │                              ↓                                  │
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │        MVCC (mvcc/) + cleanup (cleanup/)                 │   │
//! │  │   version chains, AntiValues, snapshot visibility,       │   │
//! │  │   background pruning                                     │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! │                              ↓                                  │
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │     B+-tree (tree/)  [Policy-Swappable Splits/Joins]    │   │
//! │  │   LEFT | RIGHT | EVEN | NICE | LEFT90 | RIGHT90 | PACK  │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! │                              ↓                                  │
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │              Buffer Pool (buffer/)                       │   │
//! │  │   frames + pins + CLOCK eviction + journal-gated         │   │
//! │  │   write-back                                             │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! │                    ↓                       ↓                    │
//! │  ┌──────────────────────────┐  ┌─────────────────────────────┐ │
//! │  │    Volumes (volume/)     │  │     Journal (journal/)      │ │
//! │  │  header, free chain,     │  │  segments, page-index,      │ │
//! │  │  directory, long records │  │  checkpoints, recovery      │ │
//! │  └──────────────────────────┘  └─────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//! - [`common`] - Shared primitives (ids, errors, config, timestamps)
//! - [`encoding`] - Order-preserving key codec and typed values
//! - [`page`] - Page layout and the key-block record directory
//! - [`buffer`] - Buffer pool, pins, eviction policies
//! - [`volume`] - Page files, free chain, tree directory
//! - [`tree`] - B+-tree, split/join policies, the Exchange cursor
//! - [`longrec`] - Multi-page value chains
//! - [`journal`] - Write-ahead log and crash recovery
//! - [`mvcc`] - Version chains, transactions, visibility
//! - [`cleanup`] - Background pruning and page reclamation
//! - [`engine`] - The engine handle tying everything together
//! - [`sequencer`] - Test-only deterministic scheduling hooks
//!
//! # Quick Start
//! ```no_run
//! use foliodb::{Configuration, Engine, Key, VolumeSpec};
//!
//! let config = Configuration::new("folio/journal")
//!     .volume(VolumeSpec::new("data", "folio/data.v01"));
//! let engine = Engine::initialize(config).unwrap();
//!
//! let mut ex = engine.exchange("data", "animals", true).unwrap();
//! let mut key = Key::new();
//! key.append_str("fox");
//! ex.to(&key).value_mut().put_str("RED_FOX");
//! ex.store().unwrap();
//!
//! ex.to(&key);
//! assert!(ex.fetch().unwrap());
//! assert_eq!(ex.value().get_str().unwrap(), "RED_FOX");
//! engine.close().unwrap();
//! ```

pub mod buffer;
pub mod cleanup;
pub mod common;
pub mod encoding;
pub mod engine;
pub mod journal;
pub mod longrec;
pub mod mvcc;
pub mod page;
pub mod sequencer;
pub mod tree;
pub mod volume;

// Re-export commonly used items at crate root for convenience
pub use common::config::{Configuration, SyncPolicy, VolumeSpec};
pub use common::{Error, PageId, Result, Timestamp, VolumeId};

pub use buffer::{BufferPoolStats, StatsSnapshot};
pub use encoding::{Key, KeySegment, Value};
pub use engine::{Engine, Transaction};
pub use tree::{Exchange, JoinPolicy, Sequence, SplitPolicy, TreeStatistics};
