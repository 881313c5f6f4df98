//! Plugin contract and registry.
//!
//! A plugin is a protocol state machine attached at namespace or client
//! scope. The registry is built once at worker construction and handed to
//! the context; there is no process-global table. It owns three maps:
//! the factory table, the parser-dispatch table `(layer, selector) ->
//! plugin name`, and the RPC method table `method -> (plugin, scope)`.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::rc::Rc;

use serde_json::Value;
use thiserror::Error;

use crate::counters::CounterDb;
use crate::ctx::ThreadCtx;
use crate::mbuf::Mbuf;
use crate::netns::{Client, Namespace};
use crate::parser::ParseCtx;
use crate::rpc::RpcError;

/// Outcome of handing a frame to a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxVerdict {
    Consumed,
    Pass,
}

/// Parse layer a dispatch selector belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layer {
    /// Selector is the EtherType.
    L2,
    /// Selector is the IP protocol number.
    L3,
    /// Selector is the ICMPv6 type byte.
    Icmpv6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParserHook {
    pub layer: Layer,
    pub selector: u16,
}

impl ParserHook {
    pub const fn new(layer: Layer, selector: u16) -> Self {
        ParserHook { layer, selector }
    }
}

/// Scope an RPC method operates on; decides how `params` is resolved to an
/// instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcScope {
    Ns,
    Client,
}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin {0} already registered")]
    DuplicateName(&'static str),
    #[error("parser hook {layer:?}/{selector:#x} already taken by {owner}")]
    DuplicateHook { layer: Layer, selector: u16, owner: &'static str },
    #[error("rpc method {method} already taken by {owner}")]
    DuplicateMethod { method: &'static str, owner: &'static str },
    #[error("unknown plugin {0}")]
    Unknown(String),
    #[error("plugin {name} has no {scope:?}-scoped instances")]
    ScopeUnsupported { name: &'static str, scope: RpcScope },
    #[error("bad init payload: {0}")]
    Init(String),
}

/// A protocol state machine instance.
///
/// All hooks are optional except `as_any` (used to reach concrete state
/// from tests and sibling plugins).
pub trait Plugin: 'static {
    fn on_rx(&mut self, _ctx: &Rc<ThreadCtx>, _m: &Mbuf, _pc: &ParseCtx) -> RxVerdict {
        RxVerdict::Pass
    }

    /// Called once when the owning client or namespace goes away. Must
    /// stop every timer the instance armed.
    fn on_destroy(&mut self, _ctx: &Rc<ThreadCtx>) {}

    fn counters(&self) -> Option<Rc<CounterDb>> {
        None
    }

    fn on_rpc(
        &mut self,
        _ctx: &Rc<ThreadCtx>,
        method: &str,
        _params: &Value,
    ) -> Result<Value, RpcError> {
        Err(RpcError::method_not_found(method))
    }

    fn as_any(&mut self) -> &mut dyn Any;
}

pub type PluginRef = Rc<RefCell<dyn Plugin>>;

/// Per-owner map of live plugin instances.
#[derive(Default)]
pub struct PluginMap {
    inner: RefCell<HashMap<&'static str, PluginRef>>,
}

impl PluginMap {
    pub fn insert(&self, name: &'static str, plug: PluginRef) {
        self.inner.borrow_mut().insert(name, plug);
    }

    pub fn get(&self, name: &str) -> Option<PluginRef> {
        self.inner.borrow().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.borrow().contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut v: Vec<_> = self.inner.borrow().keys().copied().collect();
        v.sort();
        v
    }

    /// Remove every instance, handing them back for teardown callbacks.
    pub fn drain(&self) -> Vec<(&'static str, PluginRef)> {
        self.inner.borrow_mut().drain().collect()
    }
}

/// Constructor of plugin instances plus its dispatch registrations.
pub trait PluginFactory {
    fn name(&self) -> &'static str;

    fn hooks(&self) -> Vec<ParserHook> {
        Vec::new()
    }

    fn rpc_methods(&self) -> Vec<(&'static str, RpcScope)> {
        Vec::new()
    }

    fn create_ns(
        &self,
        _ctx: &Rc<ThreadCtx>,
        _ns: &Rc<Namespace>,
        _init: &Value,
    ) -> Result<PluginRef, PluginError> {
        Err(PluginError::ScopeUnsupported { name: self.name(), scope: RpcScope::Ns })
    }

    fn create_client(
        &self,
        _ctx: &Rc<ThreadCtx>,
        _client: &Rc<Client>,
        _init: &Value,
    ) -> Result<PluginRef, PluginError> {
        Err(PluginError::ScopeUnsupported { name: self.name(), scope: RpcScope::Client })
    }
}

/// Factory, parser-dispatch and RPC-method tables, fixed after worker
/// construction.
#[derive(Default)]
pub struct PluginRegistry {
    factories: HashMap<&'static str, Rc<dyn PluginFactory>>,
    hooks: HashMap<(Layer, u16), &'static str>,
    methods: HashMap<&'static str, (&'static str, RpcScope)>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory; duplicate names, parser hooks or RPC methods
    /// are errors.
    pub fn register(&mut self, factory: Rc<dyn PluginFactory>) -> Result<(), PluginError> {
        self.register_inner(factory, false)
    }

    /// Register a factory, displacing previous owners of its hooks and
    /// methods.
    pub fn register_replacing(&mut self, factory: Rc<dyn PluginFactory>) {
        self.register_inner(factory, true).expect("replacing registration cannot fail");
    }

    fn register_inner(
        &mut self,
        factory: Rc<dyn PluginFactory>,
        replace: bool,
    ) -> Result<(), PluginError> {
        let name = factory.name();
        if !replace && self.factories.contains_key(name) {
            return Err(PluginError::DuplicateName(name));
        }
        for hook in factory.hooks() {
            match self.hooks.entry((hook.layer, hook.selector)) {
                Entry::Occupied(mut e) if replace => {
                    e.insert(name);
                }
                Entry::Occupied(e) => {
                    return Err(PluginError::DuplicateHook {
                        layer: hook.layer,
                        selector: hook.selector,
                        owner: *e.get(),
                    });
                }
                Entry::Vacant(e) => {
                    e.insert(name);
                }
            }
        }
        for (method, scope) in factory.rpc_methods() {
            match self.methods.entry(method) {
                Entry::Occupied(mut e) if replace => {
                    e.insert((name, scope));
                }
                Entry::Occupied(e) => {
                    return Err(PluginError::DuplicateMethod { method, owner: e.get().0 });
                }
                Entry::Vacant(e) => {
                    e.insert((name, scope));
                }
            }
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    pub fn factory(&self, name: &str) -> Result<Rc<dyn PluginFactory>, PluginError> {
        self.factories.get(name).cloned().ok_or_else(|| PluginError::Unknown(name.to_string()))
    }

    /// Resolve a parsed selector to the owning plugin name.
    pub fn hook_target(&self, layer: Layer, selector: u16) -> Option<&'static str> {
        self.hooks.get(&(layer, selector)).copied()
    }

    /// Resolve an RPC method to its plugin and scope.
    pub fn rpc_target(&self, method: &str) -> Option<(&'static str, RpcScope)> {
        self.methods.get(method).copied()
    }
}
