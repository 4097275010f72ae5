//! EntitySet - an ordered, indexed, observable collection of entities.
//!
//! One operation does all the work: [`EntitySet::reconcile`] converges the
//! member list toward an input list under `add`/`remove`/`merge` toggles.
//! Everything else (`add`, `reset`, `fetch`, `push`...) is a thin layer over
//! it.
//!
//! Algorithm (reconcile):
//! 1. Resolve each input against the indexes: a hit merges (when allowed),
//!    a miss materializes a new member (when allowed). Duplicate ids in the
//!    input collapse onto the first occurrence.
//! 2. Members not named by the input are removed (when allowed), each
//!    announcing `"remove"` with the index it held at removal time.
//! 3. With add+remove both on and no comparator or explicit index in play,
//!    the surviving members are reordered to input order; a `"sort"` fires if
//!    that changed anything observable.
//! 4. Otherwise additions splice in at the requested index (negative wraps
//!    from the end) or append, and a comparator re-sorts silently before the
//!    `"add"` notifications go out, each carrying its resolved index when one
//!    was requested.
//!
//! Member events rebroadcast through the set via a relay subscribed to each
//! member's `"all"` channel. `"add"`/`"remove"` belonging to another set are
//! not relayed, `"destroy"` removes the member, and an id change re-indexes
//! before relaying.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};

use serde_json::Value;

use crate::emitter::{handler, Emitter, Handler, Observable, Payload};
use crate::entity::{BuildOptions, DefaultHooks, Entity, EntityHooks, MutateOptions, SaveOptions};
use crate::error::{Error, Result};
use crate::ident::{id_key, value_cmp};
use crate::transport::{Method, Request, Transport};
use crate::{Attrs, ClientId};

/// Virtual override points for set subtypes.
pub trait SetHooks {
    /// The hook set given to members materialized from raw attributes.
    fn entity_hooks(&self) -> Rc<dyn EntityHooks> {
        Rc::new(DefaultHooks)
    }

    /// Convert an inbound server representation into a list of attribute
    /// maps, one per member.
    fn parse(&self, raw: Value) -> Vec<Attrs> {
        match raw {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .collect(),
            Value::Object(map) => vec![map],
            _ => Vec::new(),
        }
    }

    /// Base url for persistence of the set and its members.
    fn url(&self) -> Option<String> {
        None
    }
}

/// The hook set every plain entity set uses.
pub struct DefaultSetHooks;

impl SetHooks for DefaultSetHooks {}

/// An input to [`EntitySet::reconcile`]: an existing entity, or raw
/// attributes to materialize one from.
#[derive(Clone)]
pub enum Item {
    Entity(Entity),
    Attrs(Attrs),
}

impl From<Entity> for Item {
    fn from(entity: Entity) -> Self {
        Item::Entity(entity)
    }
}

impl From<Attrs> for Item {
    fn from(attrs: Attrs) -> Self {
        Item::Attrs(attrs)
    }
}

/// Member ordering policy.
#[derive(Clone)]
pub enum Comparator {
    /// Order by one attribute under the crate-wide JSON value order.
    Attribute(String),
    /// Order by an arbitrary ranking function.
    Ranking(Rc<dyn Fn(&Entity, &Entity) -> Ordering>),
}

impl Comparator {
    pub fn attribute(name: impl Into<String>) -> Self {
        Comparator::Attribute(name.into())
    }

    pub fn ranking<F>(f: F) -> Self
    where
        F: Fn(&Entity, &Entity) -> Ordering + 'static,
    {
        Comparator::Ranking(Rc::new(f))
    }

    fn compare(&self, a: &Entity, b: &Entity) -> Ordering {
        match self {
            Comparator::Attribute(name) => value_cmp(
                &a.get(name).unwrap_or(Value::Null),
                &b.get(name).unwrap_or(Value::Null),
            ),
            Comparator::Ranking(f) => f(a, b),
        }
    }
}

impl std::fmt::Debug for Comparator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Comparator::Attribute(name) => f.debug_tuple("Attribute").field(name).finish(),
            Comparator::Ranking(_) => f.write_str("Ranking(..)"),
        }
    }
}

/// Options for [`EntitySet::reconcile`] and the operations layered on it.
#[derive(Debug, Clone, Copy)]
pub struct SetOptions {
    /// Materialize input items with no current counterpart.
    pub add: bool,
    /// Remove members the input does not name.
    pub remove: bool,
    /// Merge input attributes into matched members.
    pub merge: bool,
    /// Insert additions at this index; negative counts from the end.
    pub at: Option<isize>,
    /// Allow comparator re-sorting as part of the operation.
    pub sort: bool,
    /// Suppress all events.
    pub silent: bool,
    /// Pass raw attributes through the entity parse hook.
    pub parse: bool,
    /// Validate materialized and merged members.
    pub validate: bool,
}

impl Default for SetOptions {
    fn default() -> Self {
        SetOptions {
            add: true,
            remove: true,
            merge: true,
            at: None,
            sort: true,
            silent: false,
            parse: false,
            validate: false,
        }
    }
}

/// Options for [`EntitySet::fetch`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    /// Replace the membership wholesale instead of reconciling.
    pub reset: bool,
    /// Options forwarded to the reconcile (or reset) applying the response.
    pub apply: SetOptions,
}

struct SetState {
    members: Vec<Entity>,
    by_id: HashMap<String, Entity>,
    by_cid: HashMap<ClientId, Entity>,
    comparator: Option<Comparator>,
}

pub(crate) struct SetInner {
    emitter: Emitter,
    hooks: Rc<dyn SetHooks>,
    /// One relay shared by all members, removable by pointer identity.
    relay: Handler,
    state: RefCell<SetState>,
}

/// A shared handle to one entity set. `Clone` yields another handle to the
/// same set; equality is identity.
#[derive(Clone)]
pub struct EntitySet {
    inner: Rc<SetInner>,
}

impl Default for EntitySet {
    fn default() -> Self {
        Self::new()
    }
}

impl EntitySet {
    pub fn new() -> Self {
        Self::with_hooks(Rc::new(DefaultSetHooks))
    }

    pub fn with_hooks(hooks: Rc<dyn SetHooks>) -> Self {
        let inner = Rc::new_cyclic(|weak: &Weak<SetInner>| {
            let weak = weak.clone();
            let relay = handler(move |name, payload| Self::relay_event(&weak, name, payload));
            SetInner {
                emitter: Emitter::new(),
                hooks,
                relay,
                state: RefCell::new(SetState {
                    members: Vec::new(),
                    by_id: HashMap::new(),
                    by_cid: HashMap::new(),
                    comparator: None,
                }),
            }
        });
        EntitySet { inner }
    }

    pub fn with_comparator(comparator: Comparator) -> Self {
        let set = Self::new();
        set.set_comparator(Some(comparator));
        set
    }

    /// A new set seeded with `items` (no events fire during seeding).
    pub fn from_items(items: Vec<Item>) -> Self {
        let set = Self::new();
        set.reset(
            items,
            &SetOptions {
                silent: true,
                ..Default::default()
            },
        );
        set
    }

    pub(crate) fn from_inner(inner: Rc<SetInner>) -> Self {
        EntitySet { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<SetInner> {
        Rc::downgrade(&self.inner)
    }

    fn events(&self) -> &Emitter {
        &self.inner.emitter
    }

    fn same(&self, other: &EntitySet) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn len(&self) -> usize {
        self.inner.state.borrow().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state.borrow().members.is_empty()
    }

    /// The member list in order.
    pub fn members(&self) -> Vec<Entity> {
        self.inner.state.borrow().members.clone()
    }

    /// Member at `index`; negative indexes count from the end.
    pub fn at(&self, index: isize) -> Option<Entity> {
        let state = self.inner.state.borrow();
        let len = state.members.len() as isize;
        let index = if index < 0 { index + len } else { index };
        if (0..len).contains(&index) {
            Some(state.members[index as usize].clone())
        } else {
            None
        }
    }

    /// Look up a member by id value. Null never matches.
    pub fn get(&self, id: &Value) -> Option<Entity> {
        let key = id_key(id)?;
        self.inner.state.borrow().by_id.get(&key).cloned()
    }

    pub fn get_by_cid(&self, cid: ClientId) -> Option<Entity> {
        self.inner.state.borrow().by_cid.get(&cid).cloned()
    }

    /// Members whose attributes structurally match every given attribute.
    pub fn where_matches(&self, attrs: &Attrs) -> Vec<Entity> {
        self.members()
            .into_iter()
            .filter(|m| m.matches(attrs))
            .collect()
    }

    pub fn find_where(&self, attrs: &Attrs) -> Option<Entity> {
        self.members().into_iter().find(|m| m.matches(attrs))
    }

    /// The value of one attribute from every member, in order.
    pub fn pluck(&self, attr: &str) -> Vec<Value> {
        self.members()
            .iter()
            .map(|m| m.get(attr).unwrap_or(Value::Null))
            .collect()
    }

    pub fn to_json(&self) -> Value {
        Value::Array(self.members().iter().map(Entity::to_json).collect())
    }

    pub fn comparator(&self) -> Option<Comparator> {
        self.inner.state.borrow().comparator.clone()
    }

    /// Install or clear the ordering policy. Existing members are not
    /// re-sorted until the next sort-triggering operation.
    pub fn set_comparator(&self, comparator: Option<Comparator>) {
        self.inner.state.borrow_mut().comparator = comparator;
    }

    pub fn url(&self) -> Option<String> {
        self.inner.hooks.url()
    }

    pub fn hooks(&self) -> Rc<dyn SetHooks> {
        self.inner.hooks.clone()
    }

    /// Converge the member list toward `items`. Returns the resolved member
    /// per input item, in input order; items rejected by validation are
    /// skipped (after `"invalid"` fires on the set).
    pub fn reconcile(&self, items: Vec<Item>, options: &SetOptions) -> Vec<Entity> {
        let prior_len = self.len();
        let at = options.at.map(|mut at| {
            if at < 0 {
                at += prior_len as isize + 1;
            }
            at.clamp(0, prior_len as isize) as usize
        });

        let comparator = self.comparator();
        let sortable = comparator.is_some() && at.is_none() && options.sort;
        let sort_attr = match &comparator {
            Some(Comparator::Attribute(name)) => Some(name.clone()),
            _ => None,
        };
        let mut sort = false;

        let mut resolved: Vec<Entity> = Vec::new();
        let mut input_order: Vec<Entity> = Vec::new();
        let mut kept: HashSet<ClientId> = HashSet::new();
        let mut to_add: Vec<Entity> = Vec::new();
        let mut to_merge: Vec<Entity> = Vec::new();

        for item in items {
            if let Some(existing) = self.resolve(&item) {
                if options.merge && !matches!(&item, Item::Entity(e) if *e == existing) {
                    let mut attrs = match item {
                        Item::Entity(e) => e.attributes(),
                        Item::Attrs(a) => a,
                    };
                    if options.parse {
                        attrs = existing.hooks().parse(Value::Object(attrs));
                    }
                    // A validation rejection already announced itself through
                    // the relay.
                    existing
                        .mutate(
                            attrs,
                            &MutateOptions {
                                silent: options.silent,
                                validate: options.validate,
                                unset: false,
                            },
                        )
                        .ok();
                    to_merge.push(existing.clone());
                    if sortable && !sort {
                        sort = match &sort_attr {
                            Some(attr) => existing.has_changed(Some(attr)),
                            None => existing.has_changed(None),
                        };
                    }
                }
                if kept.insert(existing.cid()) {
                    input_order.push(existing.clone());
                }
                resolved.push(existing);
            } else if options.add {
                if let Some(entity) = self.prepare(item, options) {
                    self.add_reference(&entity);
                    kept.insert(entity.cid());
                    input_order.push(entity.clone());
                    to_add.push(entity.clone());
                    resolved.push(entity);
                }
            }
        }

        let mut to_remove: Vec<Entity> = Vec::new();
        if options.remove {
            to_remove = self
                .inner
                .state
                .borrow()
                .members
                .iter()
                .filter(|m| !kept.contains(&m.cid()))
                .cloned()
                .collect();
            if !to_remove.is_empty() {
                self.remove_members(&to_remove, options);
            }
        }

        // Input order becomes member order only in full-replacement mode
        // with no comparator and no explicit index.
        let mut order_changed = false;
        let replace = !sortable && options.add && options.remove;
        if !input_order.is_empty() && replace {
            let mut state = self.inner.state.borrow_mut();
            order_changed = state.members.len() != input_order.len()
                || state
                    .members
                    .iter()
                    .zip(&input_order)
                    .any(|(current, incoming)| current != incoming);
            state.members = input_order;
        } else if !to_add.is_empty() {
            if sortable {
                sort = true;
            }
            let mut state = self.inner.state.borrow_mut();
            let index = at.unwrap_or(state.members.len()).min(state.members.len());
            for (i, entity) in to_add.iter().enumerate() {
                state.members.insert(index + i, entity.clone());
            }
        }

        if sort {
            if let Some(comparator) = &comparator {
                self.apply_sort(comparator);
            }
        }

        tracing::debug!(
            added = to_add.len(),
            removed = to_remove.len(),
            merged = to_merge.len(),
            members = self.len(),
            "reconcile"
        );

        if !options.silent {
            for (i, entity) in to_add.iter().enumerate() {
                entity.trigger(
                    "add",
                    &Payload::Add {
                        entity: entity.clone(),
                        set: self.clone(),
                        index: at.map(|at| at + i),
                    },
                );
            }
            if sort || order_changed {
                self.events().trigger("sort", &Payload::Sort { set: self.clone() });
            }
        }

        resolved
    }

    /// Singular [`EntitySet::reconcile`].
    pub fn reconcile_one(&self, item: Item, options: &SetOptions) -> Option<Entity> {
        self.reconcile(vec![item], options).into_iter().next()
    }

    /// Add without removing or merging: unmatched inputs join, matched ones
    /// are left alone.
    pub fn add(&self, items: Vec<Item>, options: &SetOptions) -> Vec<Entity> {
        self.reconcile(
            items,
            &SetOptions {
                add: true,
                remove: false,
                merge: false,
                ..*options
            },
        )
    }

    /// Singular [`EntitySet::add`].
    pub fn add_one(&self, item: Item, options: &SetOptions) -> Option<Entity> {
        self.add(vec![item], options).into_iter().next()
    }

    /// Remove the members matching `items`. Each removal announces
    /// `"remove"` (relayed through the set) before its relay subscription is
    /// released. Returns the entities actually removed.
    pub fn remove(&self, items: Vec<Item>, options: &SetOptions) -> Vec<Entity> {
        let targets: Vec<Entity> = items
            .iter()
            .filter_map(|item| self.resolve(item))
            .collect();
        self.remove_members(&targets, options)
    }

    pub fn remove_one(&self, entity: &Entity, options: &SetOptions) -> Option<Entity> {
        self.remove_members(std::slice::from_ref(entity), options)
            .into_iter()
            .next()
    }

    /// Replace the entire membership. Old members detach silently; the new
    /// ones join silently; one `"reset"` carries the discarded member list.
    pub fn reset(&self, items: Vec<Item>, options: &SetOptions) -> Vec<Entity> {
        let previous = self.members();
        for entity in &previous {
            self.remove_reference(entity);
        }
        {
            let mut state = self.inner.state.borrow_mut();
            state.members.clear();
            state.by_id.clear();
            state.by_cid.clear();
        }

        let resolved = self.reconcile(
            items,
            &SetOptions {
                silent: true,
                ..*options
            },
        );
        if !options.silent {
            self.events().trigger(
                "reset",
                &Payload::Reset {
                    set: self.clone(),
                    previous,
                },
            );
        }
        resolved
    }

    /// Append one member.
    pub fn push(&self, item: Item) -> Option<Entity> {
        self.add_one(item, &SetOptions::default())
    }

    /// Remove and return the last member.
    pub fn pop(&self) -> Option<Entity> {
        let last = self.at(-1)?;
        self.remove_one(&last, &SetOptions::default())
    }

    /// Prepend one member.
    pub fn unshift(&self, item: Item) -> Option<Entity> {
        self.add_one(
            item,
            &SetOptions {
                at: Some(0),
                ..Default::default()
            },
        )
    }

    /// Remove and return the first member.
    pub fn shift(&self) -> Option<Entity> {
        let first = self.at(0)?;
        self.remove_one(&first, &SetOptions::default())
    }

    /// Re-sort under the installed comparator. Stable, so equal-ranked
    /// members keep their relative order.
    pub fn sort(&self, options: &SetOptions) -> Result<()> {
        let comparator = self
            .inner
            .state
            .borrow()
            .comparator
            .clone()
            .ok_or(Error::MissingComparator)?;
        self.apply_sort(&comparator);
        if !options.silent {
            self.events().trigger("sort", &Payload::Sort { set: self.clone() });
        }
        Ok(())
    }

    /// Fetch the server representation and apply it (reconcile, or reset when
    /// requested).
    pub fn fetch(&self, transport: &dyn Transport, options: &FetchOptions) -> Result<Vec<Entity>> {
        let url = self.url().ok_or(Error::MissingUrl)?;
        let request = Request {
            method: Method::Read,
            url,
            body: None,
        };
        self.events()
            .trigger("request", &Payload::Request { method: Method::Read });
        let response = self.exchange(transport, &request)?;
        let items: Vec<Item> = self
            .inner
            .hooks
            .parse(response.clone())
            .into_iter()
            .map(Item::Attrs)
            .collect();
        let resolved = if options.reset {
            self.reset(items, &options.apply)
        } else {
            self.reconcile(items, &options.apply)
        };
        self.events().trigger(
            "sync",
            &Payload::Sync {
                response: response.clone(),
            },
        );
        Ok(resolved)
    }

    /// Materialize a member from attributes, add it, and persist it through
    /// its own save.
    pub fn create(
        &self,
        attrs: Attrs,
        transport: &dyn Transport,
        options: &SetOptions,
    ) -> Result<Entity> {
        let entity = Entity::build(
            attrs,
            self.inner.hooks.entity_hooks(),
            &BuildOptions {
                parse: options.parse,
                validate: options.validate,
            },
        );
        if let Some(error) = entity.validation_error() {
            self.events()
                .trigger("invalid", &Payload::Invalid { error: error.clone() });
            return Err(Error::Validation(error));
        }
        entity.attach_owner(self);
        self.add(vec![Item::Entity(entity.clone())], options);
        entity.save(None, transport, &SaveOptions::default())?;
        Ok(entity)
    }

    fn exchange(&self, transport: &dyn Transport, request: &Request) -> Result<Value> {
        transport.sync(request).map_err(|error| {
            self.events().trigger(
                "error",
                &Payload::TransportError {
                    error: error.clone(),
                },
            );
            Error::Transport(error)
        })
    }

    /// Resolve an input against the indexes: id key first, then cid. This is
    /// the identity rule [`EntitySet::reconcile`] matches members with.
    pub fn resolve(&self, item: &Item) -> Option<Entity> {
        let state = self.inner.state.borrow();
        match item {
            Item::Entity(entity) => {
                if let Some(key) = entity.index_key() {
                    if let Some(found) = state.by_id.get(&key) {
                        return Some(found.clone());
                    }
                }
                state.by_cid.get(&entity.cid()).cloned()
            }
            Item::Attrs(attrs) => {
                let hooks = self.inner.hooks.entity_hooks();
                let key = attrs.get(hooks.id_attribute()).and_then(id_key)?;
                state.by_id.get(&key).cloned()
            }
        }
    }

    /// Turn an input into a member candidate, claiming ownership. Raw
    /// attributes that fail validation are announced and dropped.
    fn prepare(&self, item: Item, options: &SetOptions) -> Option<Entity> {
        let entity = match item {
            Item::Entity(entity) => entity,
            Item::Attrs(attrs) => {
                let entity = Entity::build(
                    attrs,
                    self.inner.hooks.entity_hooks(),
                    &BuildOptions {
                        parse: options.parse,
                        validate: options.validate,
                    },
                );
                if let Some(error) = entity.validation_error() {
                    self.events()
                        .trigger("invalid", &Payload::Invalid { error });
                    return None;
                }
                entity
            }
        };
        entity.attach_owner(self);
        Some(entity)
    }

    fn add_reference(&self, entity: &Entity) {
        {
            let mut state = self.inner.state.borrow_mut();
            state.by_cid.insert(entity.cid(), entity.clone());
            if let Some(key) = entity.index_key() {
                state.by_id.insert(key, entity.clone());
            }
        }
        entity.on("all", self.inner.relay.clone(), Some(self.events().id()));
    }

    fn remove_reference(&self, entity: &Entity) {
        entity.detach_owner(self);
        entity.off(Some("all"), Some(&self.inner.relay), Some(self.events().id()));
    }

    fn remove_members(&self, entities: &[Entity], options: &SetOptions) -> Vec<Entity> {
        let mut removed = Vec::new();
        for entity in entities {
            let index = {
                let mut state = self.inner.state.borrow_mut();
                let Some(index) = state.members.iter().position(|m| m == entity) else {
                    continue;
                };
                state.members.remove(index);
                state.by_cid.remove(&entity.cid());
                if let Some(key) = entity.index_key() {
                    state.by_id.remove(&key);
                }
                index
            };
            if !options.silent {
                // The relay is still attached, so the set rebroadcasts this.
                entity.trigger(
                    "remove",
                    &Payload::Remove {
                        entity: entity.clone(),
                        set: self.clone(),
                        index,
                    },
                );
            }
            removed.push(entity.clone());
            self.remove_reference(entity);
        }
        removed
    }

    fn apply_sort(&self, comparator: &Comparator) {
        // Sort a copy so a ranking function reading entity state never runs
        // against a borrowed member list.
        let mut members = self.inner.state.borrow().members.clone();
        members.sort_by(|a, b| comparator.compare(a, b));
        self.inner.state.borrow_mut().members = members;
    }

    /// Refresh the id index after a member's id attribute changed.
    fn reindex(&self, entity: &Entity) {
        let mut state = self.inner.state.borrow_mut();
        let id_attr = entity.id_attribute();
        if let Some(previous) = entity.previous(&id_attr) {
            if let Some(key) = id_key(&previous) {
                state.by_id.remove(&key);
            }
        }
        if let Some(key) = entity.index_key() {
            state.by_id.insert(key, entity.clone());
        }
    }

    fn relay_event(weak: &Weak<SetInner>, name: &str, payload: &Payload) {
        let Some(inner) = weak.upgrade() else { return };
        let set = EntitySet { inner };
        match payload {
            // Membership events belonging to another set stay there.
            Payload::Add { set: owner, .. } | Payload::Remove { set: owner, .. } => {
                if !set.same(owner) {
                    return;
                }
            }
            Payload::Destroy { entity, .. } => {
                set.remove_one(entity, &SetOptions::default());
            }
            Payload::Change { entity } => {
                let id_attr = entity.id_attribute();
                if entity.has_changed(Some(&id_attr)) {
                    set.reindex(entity);
                }
            }
            _ => {}
        }
        set.events().trigger(name, payload);
    }
}

impl Observable for EntitySet {
    fn emitter(&self) -> Emitter {
        self.inner.emitter.clone()
    }
}

impl PartialEq for EntitySet {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for EntitySet {}

impl std::fmt::Debug for EntitySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut dbg = f.debug_struct("EntitySet");
        if let Ok(state) = self.inner.state.try_borrow() {
            dbg.field("len", &state.members.len());
            dbg.field("comparator", &state.comparator);
        }
        dbg.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: Value) -> Attrs {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object literal"),
        }
    }

    fn items(value: Value) -> Vec<Item> {
        match value {
            Value::Array(list) => list
                .into_iter()
                .map(|v| Item::Attrs(attrs(v)))
                .collect(),
            _ => panic!("expected an array literal"),
        }
    }

    fn log_events(set: &EntitySet, name: &str) -> Rc<RefCell<Vec<String>>> {
        let log: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        set.on(
            name,
            handler(move |event, _| sink.borrow_mut().push(event.to_string())),
            None,
        );
        log
    }

    #[test]
    fn reconcile_adds_new_members_in_input_order() {
        let set = EntitySet::new();
        let log = log_events(&set, "add");

        let resolved = set.reconcile(
            items(json!([{"id": 1, "name": "a"}, {"id": 2, "name": "b"}])),
            &SetOptions::default(),
        );

        assert_eq!(set.len(), 2);
        assert_eq!(resolved.len(), 2);
        assert_eq!(set.pluck("name"), vec![json!("a"), json!("b")]);
        assert_eq!(log.borrow().len(), 2);
    }

    #[test]
    fn reconcile_merges_by_id_and_removes_the_unnamed() {
        let set = EntitySet::new();
        set.reconcile(
            items(json!([{"id": 1, "name": "a"}, {"id": 2, "name": "b"}])),
            &SetOptions::default(),
        );
        let one = set.get(&json!(1)).unwrap();
        let events = log_events(&set, "add remove change");

        set.reconcile(
            items(json!([{"id": 1, "name": "A"}, {"id": 3, "name": "c"}])),
            &SetOptions::default(),
        );

        assert_eq!(set.len(), 2);
        assert_eq!(one.get("name"), Some(json!("A")));
        assert!(set.get(&json!(2)).is_none());
        assert!(set.get(&json!(3)).is_some());
        assert_eq!(*events.borrow(), vec!["change", "remove", "add"]);
    }

    #[test]
    fn reconcile_respects_the_toggles() {
        let set = EntitySet::new();
        set.reconcile(items(json!([{"id": 1, "name": "a"}])), &SetOptions::default());

        set.reconcile(
            items(json!([{"id": 1, "name": "A"}, {"id": 2}])),
            &SetOptions {
                add: false,
                remove: false,
                ..Default::default()
            },
        );
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(&json!(1)).unwrap().get("name"), Some(json!("A")));

        set.reconcile(
            items(json!([{"id": 1, "name": "zzz"}])),
            &SetOptions {
                merge: false,
                ..Default::default()
            },
        );
        assert_eq!(set.get(&json!(1)).unwrap().get("name"), Some(json!("A")));
    }

    #[test]
    fn duplicate_ids_collapse_onto_the_first_occurrence() {
        let set = EntitySet::new();
        let resolved = set.reconcile(
            items(json!([{"id": 1, "name": "first"}, {"id": 1, "name": "second"}])),
            &SetOptions::default(),
        );

        assert_eq!(set.len(), 1);
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0], resolved[1]);
        // The later duplicate merged into the first.
        assert_eq!(set.get(&json!(1)).unwrap().get("name"), Some(json!("second")));
    }

    #[test]
    fn members_without_ids_are_all_retained() {
        let set = EntitySet::new();
        set.reconcile(
            items(json!([{"name": "a"}, {"name": "b"}])),
            &SetOptions::default(),
        );
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn reorder_to_input_order_fires_sort() {
        let set = EntitySet::new();
        set.reconcile(
            items(json!([{"id": 1}, {"id": 2}])),
            &SetOptions::default(),
        );
        let sorts = log_events(&set, "sort");

        set.reconcile(
            items(json!([{"id": 2}, {"id": 1}])),
            &SetOptions::default(),
        );
        assert_eq!(set.pluck("id"), vec![json!(2), json!(1)]);
        assert_eq!(sorts.borrow().len(), 1);

        // Same order again: no sort event.
        set.reconcile(
            items(json!([{"id": 2}, {"id": 1}])),
            &SetOptions::default(),
        );
        assert_eq!(sorts.borrow().len(), 1);
    }

    #[test]
    fn explicit_index_inserts_and_reports_positions() {
        let set = EntitySet::new();
        set.add(items(json!([{"id": 1}, {"id": 4}])), &SetOptions::default());

        let indexes: Rc<RefCell<Vec<Option<usize>>>> = Rc::new(RefCell::new(Vec::new()));
        {
            let sink = indexes.clone();
            set.on(
                "add",
                handler(move |_, payload| {
                    if let Payload::Add { index, .. } = payload {
                        sink.borrow_mut().push(*index);
                    }
                }),
                None,
            );
        }

        set.add(
            items(json!([{"id": 2}, {"id": 3}])),
            &SetOptions {
                at: Some(1),
                ..Default::default()
            },
        );
        assert_eq!(set.pluck("id"), vec![json!(1), json!(2), json!(3), json!(4)]);
        assert_eq!(*indexes.borrow(), vec![Some(1), Some(2)]);
    }

    #[test]
    fn negative_index_counts_from_the_end() {
        let set = EntitySet::new();
        set.add(items(json!([{"id": 1}, {"id": 2}])), &SetOptions::default());

        set.add(
            items(json!([{"id": 9}])),
            &SetOptions {
                at: Some(-1),
                ..Default::default()
            },
        );
        assert_eq!(set.pluck("id"), vec![json!(1), json!(2), json!(9)]);
    }

    #[test]
    fn at_wraps_negative_and_rejects_out_of_range() {
        let set = EntitySet::new();
        set.add(items(json!([{"id": 1}, {"id": 2}])), &SetOptions::default());

        assert_eq!(set.at(0).unwrap().get("id"), Some(json!(1)));
        assert_eq!(set.at(-1).unwrap().get("id"), Some(json!(2)));
        assert!(set.at(2).is_none());
        assert!(set.at(-3).is_none());
    }

    #[test]
    fn remove_reports_the_index_at_removal_time() {
        let set = EntitySet::new();
        set.add(
            items(json!([{"id": 1}, {"id": 2}, {"id": 3}])),
            &SetOptions::default(),
        );
        let indexes: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));
        {
            let sink = indexes.clone();
            set.on(
                "remove",
                handler(move |_, payload| {
                    if let Payload::Remove { index, .. } = payload {
                        sink.borrow_mut().push(*index);
                    }
                }),
                None,
            );
        }

        set.remove(
            items(json!([{"id": 1}, {"id": 3}])),
            &SetOptions::default(),
        );
        // id 3 sits at index 1 once id 1 is gone.
        assert_eq!(*indexes.borrow(), vec![0, 1]);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn removed_members_stop_relaying() {
        let set = EntitySet::new();
        let resolved = set.add(items(json!([{"id": 1}])), &SetOptions::default());
        let member = resolved[0].clone();
        let changes = log_events(&set, "change");

        set.remove_one(&member, &SetOptions::default());
        member
            .mutate_one("name", json!("x"), &MutateOptions::default())
            .unwrap();
        assert!(changes.borrow().is_empty());
        assert!(member.owner().is_none());
    }

    #[test]
    fn reset_replaces_wholesale_with_one_event() {
        let set = EntitySet::new();
        set.add(items(json!([{"id": 1}, {"id": 2}])), &SetOptions::default());
        let old = set.members();
        let adds = log_events(&set, "add remove");
        let previous: Rc<RefCell<Vec<Entity>>> = Rc::new(RefCell::new(Vec::new()));
        {
            let sink = previous.clone();
            set.on(
                "reset",
                handler(move |_, payload| {
                    if let Payload::Reset { previous, .. } = payload {
                        *sink.borrow_mut() = previous.clone();
                    }
                }),
                None,
            );
        }

        set.reset(items(json!([{"id": 3}])), &SetOptions::default());
        assert_eq!(set.len(), 1);
        assert!(adds.borrow().is_empty());
        assert_eq!(*previous.borrow(), old);
        assert!(old[0].owner().is_none());
    }

    #[test]
    fn member_events_relay_through_the_set() {
        let set = EntitySet::new();
        let resolved = set.add(items(json!([{"id": 1}])), &SetOptions::default());
        let log = log_events(&set, "change:name");

        resolved[0]
            .mutate_one("name", json!("x"), &MutateOptions::default())
            .unwrap();
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn membership_events_of_other_sets_do_not_relay() {
        let a = EntitySet::new();
        let b = EntitySet::new();
        let resolved = a.add(items(json!([{"id": 1}])), &SetOptions::default());
        let log = log_events(&a, "add remove");

        b.add_one(Item::Entity(resolved[0].clone()), &SetOptions::default());
        b.remove_one(&resolved[0], &SetOptions::default());
        assert!(log.borrow().is_empty());
        // The entity still belongs to its first set.
        assert_eq!(resolved[0].owner(), Some(a.clone()));
    }

    #[test]
    fn destroyed_members_are_removed() {
        use crate::transport::Transport;

        struct Ok200;
        impl Transport for Ok200 {
            fn sync(&self, _request: &Request) -> std::result::Result<Value, Value> {
                Ok(json!({}))
            }
        }

        struct Rooted;
        impl SetHooks for Rooted {
            fn url(&self) -> Option<String> {
                Some("/things".to_string())
            }
        }

        let set = EntitySet::with_hooks(Rc::new(Rooted));
        let resolved = set.add(items(json!([{"id": 1}])), &SetOptions::default());
        let log = log_events(&set, "remove destroy");

        resolved[0].destroy(&Ok200).unwrap();
        assert!(set.is_empty());
        assert_eq!(*log.borrow(), vec!["remove", "destroy"]);
    }

    #[test]
    fn id_changes_reindex_the_member() {
        let set = EntitySet::new();
        let resolved = set.add(items(json!([{"id": 1}])), &SetOptions::default());

        resolved[0]
            .mutate_one("id", json!(99), &MutateOptions::default())
            .unwrap();
        assert!(set.get(&json!(1)).is_none());
        assert_eq!(set.get(&json!(99)), Some(resolved[0].clone()));
    }

    #[test]
    fn comparator_orders_additions() {
        let set = EntitySet::with_comparator(Comparator::attribute("rank"));
        set.add(
            items(json!([{"rank": 3}, {"rank": 1}, {"rank": 2}])),
            &SetOptions::default(),
        );
        assert_eq!(set.pluck("rank"), vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn comparator_driven_add_resorts_and_fires_sort() {
        let set = EntitySet::with_comparator(Comparator::attribute("rank"));
        set.add(items(json!([{"rank": 1}, {"rank": 3}])), &SetOptions::default());
        let sorts = log_events(&set, "sort");

        set.add(items(json!([{"rank": 0}])), &SetOptions::default());
        assert_eq!(set.pluck("rank"), vec![json!(0), json!(1), json!(3)]);
        assert_eq!(sorts.borrow().len(), 1);
    }

    #[test]
    fn merge_touching_the_comparator_key_resorts() {
        let set = EntitySet::with_comparator(Comparator::attribute("rank"));
        set.add(
            items(json!([{"id": 1, "rank": 1}, {"id": 2, "rank": 2}])),
            &SetOptions::default(),
        );
        let sorts = log_events(&set, "sort");

        set.reconcile(
            items(json!([{"id": 1, "rank": 9}])),
            &SetOptions {
                remove: false,
                ..Default::default()
            },
        );
        assert_eq!(set.pluck("id"), vec![json!(2), json!(1)]);
        assert_eq!(sorts.borrow().len(), 1);

        // A merge not touching the key does not resort.
        set.reconcile(
            items(json!([{"id": 1, "name": "x"}])),
            &SetOptions {
                remove: false,
                ..Default::default()
            },
        );
        assert_eq!(sorts.borrow().len(), 1);
    }

    #[test]
    fn explicit_index_overrides_the_comparator() {
        let set = EntitySet::with_comparator(Comparator::attribute("rank"));
        set.add(items(json!([{"rank": 1}, {"rank": 3}])), &SetOptions::default());

        set.add(
            items(json!([{"rank": 9}])),
            &SetOptions {
                at: Some(0),
                ..Default::default()
            },
        );
        assert_eq!(set.pluck("rank"), vec![json!(9), json!(1), json!(3)]);
    }

    #[test]
    fn sort_without_a_comparator_is_a_configuration_fault() {
        let set = EntitySet::new();
        assert!(matches!(
            set.sort(&SetOptions::default()),
            Err(Error::MissingComparator)
        ));
    }

    #[test]
    fn ranking_comparator_sorts_stably() {
        let set = EntitySet::with_comparator(Comparator::ranking(|a, b| {
            value_cmp(
                &a.get("group").unwrap_or(Value::Null),
                &b.get("group").unwrap_or(Value::Null),
            )
        }));
        set.add(
            items(json!([
                {"group": 2, "tag": "x"},
                {"group": 1, "tag": "y"},
                {"group": 2, "tag": "z"}
            ])),
            &SetOptions::default(),
        );
        assert_eq!(set.pluck("tag"), vec![json!("y"), json!("x"), json!("z")]);
    }

    #[test]
    fn where_matches_and_find_where() {
        let set = EntitySet::new();
        set.add(
            items(json!([
                {"id": 1, "kind": "a"},
                {"id": 2, "kind": "b"},
                {"id": 3, "kind": "a"}
            ])),
            &SetOptions::default(),
        );

        let found = set.where_matches(&attrs(json!({"kind": "a"})));
        assert_eq!(found.len(), 2);
        let first = set.find_where(&attrs(json!({"kind": "a"}))).unwrap();
        assert_eq!(first.get("id"), Some(json!(1)));
        assert!(set.find_where(&attrs(json!({"kind": "zzz"}))).is_none());
    }

    #[test]
    fn stack_and_queue_operations() {
        let set = EntitySet::new();
        set.push(Item::Attrs(attrs(json!({"id": 1}))));
        set.push(Item::Attrs(attrs(json!({"id": 2}))));
        set.unshift(Item::Attrs(attrs(json!({"id": 0}))));
        assert_eq!(set.pluck("id"), vec![json!(0), json!(1), json!(2)]);

        assert_eq!(set.pop().unwrap().get("id"), Some(json!(2)));
        assert_eq!(set.shift().unwrap().get("id"), Some(json!(0)));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn invalid_items_are_skipped_with_an_invalid_event() {
        struct Positive;
        impl EntityHooks for Positive {
            fn validate(&self, attrs: &Attrs) -> Option<Value> {
                attrs
                    .get("n")
                    .and_then(Value::as_i64)
                    .filter(|n| *n < 0)
                    .map(|_| json!("negative"))
            }
        }
        struct Hooks;
        impl SetHooks for Hooks {
            fn entity_hooks(&self) -> Rc<dyn EntityHooks> {
                Rc::new(Positive)
            }
        }

        let set = EntitySet::with_hooks(Rc::new(Hooks));
        let invalid = log_events(&set, "invalid");

        let resolved = set.reconcile(
            items(json!([{"n": 1}, {"n": -1}, {"n": 2}])),
            &SetOptions {
                validate: true,
                ..Default::default()
            },
        );
        assert_eq!(set.len(), 2);
        assert_eq!(resolved.len(), 2);
        assert_eq!(invalid.borrow().len(), 1);
    }

    #[test]
    fn resolve_matches_by_id_then_by_cid() {
        let set = EntitySet::new();
        let member = set
            .add_one(Item::Attrs(attrs(json!({"id": 1}))), &SetOptions::default())
            .unwrap();

        // A different entity with the same id resolves to the member.
        let foreign = Entity::new(attrs(json!({"id": 1})));
        assert_eq!(set.resolve(&Item::Entity(foreign)), Some(member));

        // An id-less member resolves through its cid.
        let anon = set
            .add_one(Item::Attrs(attrs(json!({"name": "x"}))), &SetOptions::default())
            .unwrap();
        assert_eq!(set.resolve(&Item::Entity(anon.clone())), Some(anon));
    }

    #[test]
    fn from_items_seeds_silently() {
        let set = EntitySet::from_items(items(json!([{"id": 1}, {"id": 2}])));
        assert_eq!(set.len(), 2);
        assert_eq!(set.get(&json!(2)).unwrap().get("id"), Some(json!(2)));
    }

    #[test]
    fn to_json_snapshots_members_in_order() {
        let set = EntitySet::from_items(items(json!([{"id": 1}, {"id": 2}])));
        assert_eq!(set.to_json(), json!([{"id": 1}, {"id": 2}]));
    }

    #[test]
    fn fetch_reconciles_the_parsed_response() {
        use crate::transport::Transport;

        struct Server;
        impl Transport for Server {
            fn sync(&self, request: &Request) -> std::result::Result<Value, Value> {
                assert_eq!(request.method, Method::Read);
                assert_eq!(request.url, "/things");
                Ok(json!([{"id": 1, "name": "a"}, {"id": 2, "name": "b"}]))
            }
        }

        struct Rooted;
        impl SetHooks for Rooted {
            fn url(&self) -> Option<String> {
                Some("/things".to_string())
            }
        }

        let set = EntitySet::with_hooks(Rc::new(Rooted));
        let log = log_events(&set, "request sync");

        let resolved = set.fetch(&Server, &FetchOptions::default()).unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(set.len(), 2);
        assert_eq!(*log.borrow(), vec!["request", "sync"]);

        assert!(matches!(
            EntitySet::new().fetch(&Server, &FetchOptions::default()),
            Err(Error::MissingUrl)
        ));
    }

    // Property-based tests using proptest
    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn id_items(ids: &[u8]) -> Vec<Item> {
            ids.iter()
                .map(|id| {
                    let mut map = Attrs::new();
                    map.insert("id".to_string(), json!(id));
                    Item::Attrs(map)
                })
                .collect()
        }

        proptest! {
            #[test]
            fn prop_reconcile_is_idempotent(ids in prop::collection::vec(0u8..20, 0..12)) {
                let set = EntitySet::new();
                set.reconcile(id_items(&ids), &SetOptions::default());
                let first = set.members();
                set.reconcile(id_items(&ids), &SetOptions::default());
                prop_assert_eq!(set.members(), first);
            }

            #[test]
            fn prop_member_ids_are_unique(ids in prop::collection::vec(0u8..20, 0..24)) {
                let set = EntitySet::new();
                set.reconcile(id_items(&ids), &SetOptions::default());
                let keys: Vec<String> =
                    set.members().iter().filter_map(|m| m.index_key()).collect();
                let mut deduped = keys.clone();
                deduped.sort();
                deduped.dedup();
                prop_assert_eq!(keys.len(), deduped.len());
            }

            #[test]
            fn prop_comparator_order_holds_after_reconcile(
                ranks in prop::collection::vec(0u8..50, 0..16),
            ) {
                let set = EntitySet::with_comparator(Comparator::attribute("rank"));
                let items: Vec<Item> = ranks
                    .iter()
                    .map(|r| {
                        let mut map = Attrs::new();
                        map.insert("rank".to_string(), json!(r));
                        Item::Attrs(map)
                    })
                    .collect();
                set.reconcile(items, &SetOptions::default());

                let plucked = set.pluck("rank");
                for pair in plucked.windows(2) {
                    prop_assert_ne!(value_cmp(&pair[0], &pair[1]), Ordering::Greater);
                }
            }
        }
    }

    #[test]
    fn create_adds_then_saves_through_the_member() {
        use crate::transport::Transport;

        struct Server;
        impl Transport for Server {
            fn sync(&self, request: &Request) -> std::result::Result<Value, Value> {
                assert_eq!(request.method, Method::Create);
                assert_eq!(request.url, "/things");
                Ok(json!({"id": 7}))
            }
        }

        struct Rooted;
        impl SetHooks for Rooted {
            fn url(&self) -> Option<String> {
                Some("/things".to_string())
            }
        }

        let set = EntitySet::with_hooks(Rc::new(Rooted));
        let entity = set
            .create(attrs(json!({"name": "new"})), &Server, &SetOptions::default())
            .unwrap();
        assert_eq!(entity.id(), Some(json!(7)));
        assert_eq!(set.get(&json!(7)), Some(entity));
    }
}
