//! # Tether Engine
//!
//! An observable data layer for client applications.
//!
//! This crate provides the core state model for event-driven clients:
//! identity-bearing entities with batched change tracking, ordered observable
//! sets with a single reconciliation primitive, and a synchronous event
//! emitter with re-entrancy guarantees. Rendering, routing and IO live
//! outside; the layer's only job is to hold state and announce how it
//! changes.
//!
//! ## Design Principles
//!
//! - **No IO**: persistence goes through a caller-supplied [`Transport`]
//! - **Synchronous**: every operation completes, events included, before
//!   returning
//! - **Re-entrant**: handlers may mutate the objects that notified them
//! - **Testable**: pure logic, no mocks needed
//!
//! ## Core Concepts
//!
//! ### Entities
//!
//! An [`Entity`] is a JSON attribute map with:
//! - A process-unique client id, plus an optional persistent id attribute
//! - Batched mutation through [`Entity::mutate`], with per-attribute
//!   `"change:<attr>"` events and one `"change"` per outermost batch
//! - A `changed` delta and `previous` snapshot covering the last batch
//! - Hook points ([`EntityHooks`]) for defaults, validation and parsing
//!
//! ### Sets
//!
//! An [`EntitySet`] is an ordered collection of entities, indexed by id and
//! client id, kept sorted by an optional [`Comparator`]. Its one structural
//! operation, [`EntitySet::reconcile`], converges membership toward an input
//! list under `add`/`remove`/`merge` toggles. Member events rebroadcast
//! through the set.
//!
//! ### Events
//!
//! The [`Emitter`] dispatches synchronously over snapshots, so subscribing
//! or unsubscribing mid-dispatch never skips or double-invokes the pass in
//! flight. [`Observable`] gives entities and sets the full surface,
//! including the `listen_to` bookkeeping for one-call teardown.
//!
//! ## Quick Start
//!
//! ```rust
//! use serde_json::{json, Map};
//! use tether_engine::{handler, EntitySet, Item, Observable, SetOptions};
//!
//! let todos = EntitySet::new();
//! todos.on(
//!     "add",
//!     handler(|_, _| println!("one more thing to do")),
//!     None,
//! );
//!
//! let items: Vec<Item> = [json!({"id": 1, "title": "write"})]
//!     .into_iter()
//!     .filter_map(|v| match v {
//!         serde_json::Value::Object(map) => Some(Item::Attrs(map)),
//!         _ => None,
//!     })
//!     .collect();
//! let resolved = todos.reconcile(items, &SetOptions::default());
//!
//! assert_eq!(todos.len(), 1);
//! assert_eq!(resolved[0].get("title"), Some(json!("write")));
//!
//! let mut patch = Map::new();
//! patch.insert("done".into(), json!(true));
//! resolved[0].mutate(patch, &Default::default()).unwrap();
//! assert!(resolved[0].has_changed(Some("done")));
//! ```
//!
//! ## Persistence
//!
//! [`Entity::fetch`]/[`Entity::save`]/[`Entity::destroy`] and
//! [`EntitySet::fetch`]/[`EntitySet::create`] drive a [`Transport`] you
//! supply, announcing `"request"`, then `"sync"` or `"error"`.

pub mod emitter;
pub mod entity;
pub mod error;
pub mod ident;
pub mod set;
pub mod transport;

// Re-export main types at crate root
pub use emitter::{handler, Emitter, Handler, Observable, Payload};
pub use entity::{
    BuildOptions, DefaultHooks, Entity, EntityHooks, MutateOptions, SaveOptions,
};
pub use error::{Error, Result};
pub use ident::{id_key, value_cmp};
pub use set::{
    Comparator, DefaultSetHooks, EntitySet, FetchOptions, Item, SetHooks, SetOptions,
};
pub use transport::{Method, Request, Transport};

/// Type aliases for clarity
pub type Attrs = serde_json::Map<String, serde_json::Value>;
pub type ClientId = u64;
pub type EmitterId = u64;
