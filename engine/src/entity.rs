//! Entity - an identity-bearing, change-tracked attribute bag.
//!
//! All mutation funnels through [`Entity::mutate`], which diffs each applied
//! attribute against both the current value (deciding this tick's
//! `"change:<attr>"` emissions) and the snapshot taken at the start of the
//! outermost mutation (deciding membership in `changed`). Mutations triggered
//! from inside change handlers nest: they contribute to the outer batch, and
//! the single `"change"` event is drained only once the outermost call
//! unwinds.
//!
//! Subtype behavior (defaults, validation, parsing, url roots) hangs off the
//! [`EntityHooks`] trait rather than inheritance.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use serde_json::Value;

use crate::emitter::{Emitter, Observable, Payload};
use crate::error::{Error, Result};
use crate::ident::{id_key, next_client_id};
use crate::set::{EntitySet, SetInner};
use crate::transport::{Method, Request, Transport};
use crate::{Attrs, ClientId};

/// Virtual override points for entity subtypes.
///
/// The default implementation is an entity with id attribute `"id"`, no
/// defaults, no validation and pass-through parsing.
pub trait EntityHooks {
    /// Name of the attribute that carries the entity's persistent identity.
    fn id_attribute(&self) -> &str {
        "id"
    }

    /// Attributes merged beneath whatever the constructor receives.
    fn defaults(&self) -> Attrs {
        Attrs::new()
    }

    /// Runs once, after construction.
    fn initialize(&self, _entity: &Entity) {}

    /// Validate a prospective complete attribute set. Returning an error
    /// value rejects the mutation that produced it.
    fn validate(&self, _attrs: &Attrs) -> Option<Value> {
        None
    }

    /// Convert an inbound server representation into attributes.
    fn parse(&self, raw: Value) -> Attrs {
        match raw {
            Value::Object(map) => map,
            _ => Attrs::new(),
        }
    }

    /// Base url for persistence of unowned entities.
    fn url_root(&self) -> Option<String> {
        None
    }
}

/// The hook set every plain entity uses.
pub struct DefaultHooks;

impl EntityHooks for DefaultHooks {}

/// Options for [`Entity::mutate`] and friends.
#[derive(Debug, Clone, Copy, Default)]
pub struct MutateOptions {
    /// Delete the named attributes instead of assigning them.
    pub unset: bool,
    /// Apply without emitting change events.
    pub silent: bool,
    /// Run the validation hook against the prospective attribute set first.
    pub validate: bool,
}

/// Options for entity construction.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    /// Pass the supplied attributes through the parse hook first.
    pub parse: bool,
    /// Validate the initial attribute set.
    pub validate: bool,
}

/// Options for [`Entity::save`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SaveOptions {
    /// Send only the supplied attributes with [`Method::Patch`].
    pub patch: bool,
    /// Suppress change events while applying attributes.
    pub silent: bool,
}

struct EntityState {
    attributes: Attrs,
    /// Delta from the snapshot at the start of the outermost mutation.
    /// `None` values record unset attributes.
    changed: BTreeMap<String, Option<Value>>,
    /// Full snapshot taken when the outermost mutation began.
    previous: Option<Attrs>,
    changing: bool,
    pending: bool,
    validation_error: Option<Value>,
    /// Non-owning back-reference to the owning set.
    owner: Option<Weak<SetInner>>,
}

struct EntityInner {
    cid: ClientId,
    emitter: Emitter,
    hooks: Rc<dyn EntityHooks>,
    state: RefCell<EntityState>,
}

/// A shared handle to one entity. `Clone` yields another handle to the same
/// entity; equality is identity.
#[derive(Clone)]
pub struct Entity {
    inner: Rc<EntityInner>,
}

impl Entity {
    /// Construct a plain entity from initial attributes.
    pub fn new(attrs: Attrs) -> Self {
        Self::build(attrs, Rc::new(DefaultHooks), &BuildOptions::default())
    }

    /// Construct an entity with a custom hook set.
    pub fn with_hooks(attrs: Attrs, hooks: Rc<dyn EntityHooks>) -> Self {
        Self::build(attrs, hooks, &BuildOptions::default())
    }

    /// Full construction path: optional parse, defaults merged beneath the
    /// supplied attributes, one mutation pass, then the initialize hook.
    pub fn build(attrs: Attrs, hooks: Rc<dyn EntityHooks>, options: &BuildOptions) -> Self {
        let attrs = if options.parse {
            hooks.parse(Value::Object(attrs))
        } else {
            attrs
        };
        let mut merged = hooks.defaults();
        for (name, value) in attrs {
            merged.insert(name, value);
        }

        let entity = Entity {
            inner: Rc::new(EntityInner {
                cid: next_client_id(),
                emitter: Emitter::new(),
                hooks,
                state: RefCell::new(EntityState {
                    attributes: Attrs::new(),
                    changed: BTreeMap::new(),
                    previous: None,
                    changing: false,
                    pending: false,
                    validation_error: None,
                    owner: None,
                }),
            }),
        };

        // A rejected initial attribute set leaves the entity empty with
        // validation_error recording why, mirroring the mutate contract.
        let _ = entity.mutate(
            merged,
            &MutateOptions {
                validate: options.validate,
                ..Default::default()
            },
        );
        entity.inner.state.borrow_mut().changed.clear();
        entity.inner.hooks.initialize(&entity);
        entity
    }

    fn events(&self) -> &Emitter {
        &self.inner.emitter
    }

    /// Process-unique client id, stable for the entity's lifetime.
    pub fn cid(&self) -> ClientId {
        self.inner.cid
    }

    pub fn hooks(&self) -> Rc<dyn EntityHooks> {
        self.inner.hooks.clone()
    }

    pub fn id_attribute(&self) -> String {
        self.inner.hooks.id_attribute().to_string()
    }

    /// The entity id, absent when the id attribute is missing or null.
    pub fn id(&self) -> Option<Value> {
        let state = self.inner.state.borrow();
        state
            .attributes
            .get(self.inner.hooks.id_attribute())
            .filter(|v| !v.is_null())
            .cloned()
    }

    /// Canonical index key for the entity id.
    pub(crate) fn index_key(&self) -> Option<String> {
        self.id().as_ref().and_then(id_key)
    }

    /// An entity is new iff it has no id.
    pub fn is_new(&self) -> bool {
        self.id().is_none()
    }

    pub fn get(&self, attr: &str) -> Option<Value> {
        self.inner.state.borrow().attributes.get(attr).cloned()
    }

    /// True iff the attribute is present and non-null.
    pub fn has(&self, attr: &str) -> bool {
        self.inner
            .state
            .borrow()
            .attributes
            .get(attr)
            .is_some_and(|v| !v.is_null())
    }

    /// Structural match: every given attribute equals the current value.
    pub fn matches(&self, attrs: &Attrs) -> bool {
        let state = self.inner.state.borrow();
        attrs
            .iter()
            .all(|(name, value)| state.attributes.get(name) == Some(value))
    }

    pub fn attributes(&self) -> Attrs {
        self.inner.state.borrow().attributes.clone()
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.attributes())
    }

    /// Apply a batch of attribute changes - the single mutation primitive.
    ///
    /// On validation rejection nothing is applied, `"invalid"` has fired and
    /// `Err(Error::Validation)` carries the hook's error value. Otherwise one
    /// `"change:<attr>"` fires per attribute whose value differs from its
    /// immediately prior value, and a single `"change"` fires once the
    /// outermost mutation on this entity unwinds (re-emitted while handlers
    /// keep queueing further changes).
    pub fn mutate(&self, attrs: Attrs, options: &MutateOptions) -> Result<()> {
        self.run_validation(&attrs, options.validate)?;

        let was_changing;
        let mut changes: Vec<String> = Vec::new();
        {
            let mut state = self.inner.state.borrow_mut();
            was_changing = state.changing;
            state.changing = true;

            if !was_changing {
                state.previous = Some(state.attributes.clone());
                state.changed.clear();
            }

            let state = &mut *state;
            for (attr, value) in &attrs {
                let applied: Option<&Value> = if options.unset { None } else { Some(value) };
                if state.attributes.get(attr.as_str()) != applied {
                    changes.push(attr.clone());
                }
                let snapshot = state.previous.as_ref().and_then(|p| p.get(attr.as_str()));
                if snapshot != applied {
                    state.changed.insert(attr.clone(), applied.cloned());
                } else {
                    state.changed.remove(attr.as_str());
                }
                if options.unset {
                    state.attributes.remove(attr.as_str());
                } else {
                    state.attributes.insert(attr.clone(), value.clone());
                }
            }

            if !options.silent && !changes.is_empty() {
                state.pending = true;
            }
        }

        tracing::trace!(cid = self.inner.cid, changes = changes.len(), nested = was_changing, "mutate");

        if !options.silent {
            for attr in &changes {
                // Read at emission time: an earlier handler may have already
                // rewritten this attribute.
                let value = self.inner.state.borrow().attributes.get(attr).cloned();
                self.events().trigger(
                    &format!("change:{attr}"),
                    &Payload::ChangeAttr {
                        entity: self.clone(),
                        attr: attr.clone(),
                        value,
                    },
                );
            }
        }

        // Nested mutations contribute to the outer batch and stop here.
        if was_changing {
            return Ok(());
        }

        if !options.silent {
            // Changes can be queued recursively from inside "change"
            // handlers; drain until no batch is pending.
            loop {
                let pending = {
                    let mut state = self.inner.state.borrow_mut();
                    std::mem::replace(&mut state.pending, false)
                };
                if !pending {
                    break;
                }
                self.events()
                    .trigger("change", &Payload::Change { entity: self.clone() });
            }
        }

        let mut state = self.inner.state.borrow_mut();
        state.pending = false;
        state.changing = false;
        Ok(())
    }

    /// Apply a single attribute.
    pub fn mutate_one(
        &self,
        attr: impl Into<String>,
        value: Value,
        options: &MutateOptions,
    ) -> Result<()> {
        let mut attrs = Attrs::new();
        attrs.insert(attr.into(), value);
        self.mutate(attrs, options)
    }

    /// Delete an attribute, firing `"change"`. A no-op if it is absent.
    pub fn unset(&self, attr: impl Into<String>, options: &MutateOptions) -> Result<()> {
        let mut options = *options;
        options.unset = true;
        self.mutate_one(attr, Value::Null, &options)
    }

    /// Delete every current attribute, firing `"change"`.
    pub fn clear(&self, options: &MutateOptions) -> Result<()> {
        let mut attrs = Attrs::new();
        for name in self.inner.state.borrow().attributes.keys() {
            attrs.insert(name.clone(), Value::Null);
        }
        let mut options = *options;
        options.unset = true;
        self.mutate(attrs, &options)
    }

    /// Whether anything (or one named attribute) changed since the start of
    /// the last outermost mutation.
    pub fn has_changed(&self, attr: Option<&str>) -> bool {
        let state = self.inner.state.borrow();
        match attr {
            None => !state.changed.is_empty(),
            Some(attr) => state.changed.contains_key(attr),
        }
    }

    /// With no argument: the accumulated delta, or `None` when nothing
    /// changed (unset attributes surface as `null`). With a candidate map:
    /// the subset that would change relative to current state - or, while a
    /// mutation is in flight, relative to the outermost snapshot.
    pub fn changed_attributes(&self, diff: Option<&Attrs>) -> Option<Attrs> {
        let state = self.inner.state.borrow();
        let Some(diff) = diff else {
            if state.changed.is_empty() {
                return None;
            }
            return Some(
                state
                    .changed
                    .iter()
                    .map(|(name, value)| (name.clone(), value.clone().unwrap_or(Value::Null)))
                    .collect(),
            );
        };

        let old = if state.changing {
            state.previous.as_ref()
        } else {
            Some(&state.attributes)
        };
        let mut changed = Attrs::new();
        for (attr, value) in diff {
            if old.and_then(|o| o.get(attr)) == Some(value) {
                continue;
            }
            changed.insert(attr.clone(), value.clone());
        }
        if changed.is_empty() {
            None
        } else {
            Some(changed)
        }
    }

    /// Value of an attribute at the start of the last outermost mutation.
    pub fn previous(&self, attr: &str) -> Option<Value> {
        let state = self.inner.state.borrow();
        state.previous.as_ref().and_then(|p| p.get(attr)).cloned()
    }

    /// Full snapshot from the start of the last outermost mutation, absent
    /// if the entity has never been mutated.
    pub fn previous_attributes(&self) -> Option<Attrs> {
        self.inner.state.borrow().previous.clone()
    }

    /// Run the validation hook against current attributes without mutating.
    pub fn is_valid(&self) -> bool {
        self.run_validation(&Attrs::new(), true).is_ok()
    }

    /// The last validation failure, if any.
    pub fn validation_error(&self) -> Option<Value> {
        self.inner.state.borrow().validation_error.clone()
    }

    fn run_validation(&self, attrs: &Attrs, validate: bool) -> Result<()> {
        if !validate {
            return Ok(());
        }
        let mut merged = self.inner.state.borrow().attributes.clone();
        for (name, value) in attrs {
            merged.insert(name.clone(), value.clone());
        }
        let error = self.inner.hooks.validate(&merged);
        self.inner.state.borrow_mut().validation_error = error.clone();
        match error {
            None => Ok(()),
            Some(error) => {
                self.events().trigger(
                    "invalid",
                    &Payload::Invalid {
                        error: error.clone(),
                    },
                );
                Err(Error::Validation(error))
            }
        }
    }

    /// A new entity with the same attributes, fresh identity and no owner.
    pub fn duplicate(&self) -> Entity {
        Entity::with_hooks(self.attributes(), self.inner.hooks.clone())
    }

    /// The owning set, if this entity is currently a member of one.
    pub fn owner(&self) -> Option<EntitySet> {
        self.inner
            .state
            .borrow()
            .owner
            .as_ref()
            .and_then(Weak::upgrade)
            .map(EntitySet::from_inner)
    }

    /// Record the owning set, unless the entity already has one.
    pub(crate) fn attach_owner(&self, set: &EntitySet) {
        let mut state = self.inner.state.borrow_mut();
        if state.owner.as_ref().and_then(Weak::upgrade).is_none() {
            state.owner = Some(set.downgrade());
        }
    }

    /// Clear the back-reference, but only if `set` is the current owner.
    pub(crate) fn detach_owner(&self, set: &EntitySet) {
        let mut state = self.inner.state.borrow_mut();
        let is_owner = state
            .owner
            .as_ref()
            .is_some_and(|weak| weak.ptr_eq(&set.downgrade()));
        if is_owner {
            state.owner = None;
        }
    }

    /// Resolve the persistence url: the hooks' `url_root`, else the owning
    /// set's url, with the id appended for non-new entities.
    pub fn url(&self) -> Result<String> {
        let base = self
            .inner
            .hooks
            .url_root()
            .or_else(|| self.owner().and_then(|set| set.url()))
            .ok_or(Error::MissingUrl)?;
        match self.index_key() {
            None => Ok(base),
            Some(key) => {
                let sep = if base.ends_with('/') { "" } else { "/" };
                Ok(format!("{base}{sep}{key}"))
            }
        }
    }

    /// Fetch the server representation and merge it in through parse.
    pub fn fetch(&self, transport: &dyn Transport, options: &MutateOptions) -> Result<Value> {
        let request = Request {
            method: Method::Read,
            url: self.url()?,
            body: None,
        };
        self.events()
            .trigger("request", &Payload::Request { method: Method::Read });
        let response = self.exchange(transport, &request)?;
        let attrs = self.inner.hooks.parse(response.clone());
        self.mutate(attrs, options)?;
        self.events().trigger(
            "sync",
            &Payload::Sync {
                response: response.clone(),
            },
        );
        Ok(response)
    }

    /// Apply `attrs` (validated) and persist. New entities create, existing
    /// ones update - or patch just the supplied attributes when requested.
    /// Server attributes from the response are merged back through parse.
    pub fn save(
        &self,
        attrs: Option<Attrs>,
        transport: &dyn Transport,
        options: &SaveOptions,
    ) -> Result<Value> {
        let patch_body = attrs.clone();
        match attrs {
            Some(attrs) => self.mutate(
                attrs,
                &MutateOptions {
                    validate: true,
                    silent: options.silent,
                    unset: false,
                },
            )?,
            None => self.run_validation(&Attrs::new(), true)?,
        }

        let method = if self.is_new() {
            Method::Create
        } else if options.patch {
            Method::Patch
        } else {
            Method::Update
        };
        let body = if options.patch {
            Value::Object(patch_body.unwrap_or_default())
        } else {
            self.to_json()
        };
        let request = Request {
            method,
            url: self.url()?,
            body: Some(body),
        };
        self.events()
            .trigger("request", &Payload::Request { method });
        let response = self.exchange(transport, &request)?;
        let server_attrs = self.inner.hooks.parse(response.clone());
        self.mutate(
            server_attrs,
            &MutateOptions {
                silent: options.silent,
                ..Default::default()
            },
        )?;
        self.events().trigger(
            "sync",
            &Payload::Sync {
                response: response.clone(),
            },
        );
        Ok(response)
    }

    /// Delete the server representation and announce `"destroy"`, which an
    /// owning set answers by removing the entity. New entities skip the
    /// round-trip entirely.
    pub fn destroy(&self, transport: &dyn Transport) -> Result<Value> {
        if self.is_new() {
            self.announce_destroy();
            return Ok(Value::Null);
        }
        let request = Request {
            method: Method::Delete,
            url: self.url()?,
            body: None,
        };
        self.events().trigger(
            "request",
            &Payload::Request {
                method: Method::Delete,
            },
        );
        let response = self.exchange(transport, &request)?;
        self.announce_destroy();
        self.events().trigger(
            "sync",
            &Payload::Sync {
                response: response.clone(),
            },
        );
        Ok(response)
    }

    fn announce_destroy(&self) {
        let owner = self.owner();
        self.events().stop_listening(None, None, None);
        self.events().trigger(
            "destroy",
            &Payload::Destroy {
                entity: self.clone(),
                set: owner,
            },
        );
    }

    /// Issue a request, wrapping failures so `"error"` always fires on this
    /// entity in addition to the returned error.
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
}

impl Observable for Entity {
    fn emitter(&self) -> Emitter {
        self.inner.emitter.clone()
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Entity {}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut dbg = f.debug_struct("Entity");
        dbg.field("cid", &self.inner.cid);
        if let Ok(state) = self.inner.state.try_borrow() {
            dbg.field("attributes", &state.attributes);
        }
        dbg.finish()
    }
}
