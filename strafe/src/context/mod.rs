//! Execution context of a VM: the scope stack that labels logs and stats.
//!
//! A scope is pushed by every `group` a script enters and popped when it
//! leaves, on every exit path. Async continuations may read the stack while a
//! group is open, so it sits behind a lock even though only the VM thread ever
//! pushes or pops.

mod global;

use std::sync::Arc;

use parking_lot::Mutex;

pub use global::Global;

use crate::{
    metric::Tags,
    pool::{AsyncPool, ReleasePool},
    stat::Stat,
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Scope {
    pub name: String,
    pub tags: Tags,
}

impl Scope {
    /// Builds a scope from a flat `key, value, key, value...` list. A trailing
    /// key without a value is ignored.
    pub fn new<S: AsRef<str>>(name: &str, pairs: &[S]) -> Self {
        let tags = pairs
            .chunks_exact(2)
            .map(|kv| (kv[0].as_ref().to_string(), kv[1].as_ref().to_string()))
            .collect();
        Self {
            name: name.to_string(),
            tags,
        }
    }
}

pub struct Context {
    vm_id: usize,
    global: Arc<Global>,
    async_pool: Arc<AsyncPool>,
    release_pool: ReleasePool,
    scopes: Mutex<Vec<Scope>>,
}

impl Context {
    pub fn new(
        vm_id: usize,
        global: Arc<Global>,
        async_pool: Arc<AsyncPool>,
        release_pool: ReleasePool,
    ) -> Self {
        Self {
            vm_id,
            global,
            async_pool,
            release_pool,
            scopes: Mutex::new(Vec::new()),
        }
    }

    pub fn vm_id(&self) -> usize {
        self.vm_id
    }

    pub fn global(&self) -> &Arc<Global> {
        &self.global
    }

    pub fn async_pool(&self) -> &Arc<AsyncPool> {
        &self.async_pool
    }

    pub fn release_pool(&self) -> &ReleasePool {
        &self.release_pool
    }

    /// Pushes a scope. Every call must be paired with one [`exit`](Self::exit);
    /// prefer [`scoped`](Self::scoped) where a Rust scope can own the pairing.
    pub fn enter<S: AsRef<str>>(&self, name: &str, pairs: &[S]) {
        self.scopes.lock().push(Scope::new(name, pairs));
    }

    /// Pops the innermost scope.
    pub fn exit(&self) -> Option<Scope> {
        self.scopes.lock().pop()
    }

    /// Enters a scope that is exited when the guard drops.
    pub fn scoped<S: AsRef<str>>(&self, name: &str, pairs: &[S]) -> ScopeGuard<'_> {
        self.enter(name, pairs);
        ScopeGuard { ctx: self }
    }

    pub fn depth(&self) -> usize {
        self.scopes.lock().len()
    }

    /// Tags of every open scope, inner scopes winning on conflicts.
    pub fn tags(&self) -> Tags {
        let mut tags = Tags::new();
        for scope in self.scopes.lock().iter() {
            tags.extend(scope.tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        tags
    }

    /// Non-empty scope names joined with dots.
    pub fn scope_name(&self) -> String {
        self.scopes
            .lock()
            .iter()
            .filter(|s| !s.name.is_empty())
            .map(|s| s.name.as_str())
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Display form of the scope, `outer.inner(k=v,...)`.
    pub fn scope(&self) -> String {
        let mut scope = self.scope_name();
        let tags = self.tags();
        if !tags.is_empty() {
            let tags: Vec<String> = tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
            scope.push('(');
            scope.push_str(&tags.join(","));
            scope.push(')');
        }
        scope
    }

    pub fn info(&self, msg: &str) {
        tracing::info!(vm = self.vm_id, scope = %self.scope(), tags = ?self.tags(), "{msg}");
    }

    pub fn warn(&self, msg: &str) {
        tracing::warn!(vm = self.vm_id, scope = %self.scope(), tags = ?self.tags(), "{msg}");
    }

    pub fn error(&self, msg: &str) {
        tracing::error!(vm = self.vm_id, scope = %self.scope(), tags = ?self.tags(), "{msg}");
    }

    /// Reports stats labelled with the current scope: a `scope` tag holding the
    /// scope name and one `scope:<key>` tag per scope tag.
    pub fn report(&self, mut stats: Vec<Stat>) {
        let name = self.scope_name();
        let tags = self.tags();
        for stat in &mut stats {
            stat.tags.insert("scope".to_string(), name.clone());
            for (k, v) in &tags {
                stat.tags.insert(format!("scope:{k}"), v.clone());
            }
        }
        self.global.report(stats);
    }
}

/// Exits its scope on drop.
pub struct ScopeGuard<'a> {
    ctx: &'a Context,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        self.ctx.exit();
    }
}
