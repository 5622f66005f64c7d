//! Named event hooks (`MODULE::NAME`) with synchronous subscribers.

use std::collections::HashMap;
use std::fmt;

use crate::error::HookError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Module {
    Accounts,
    Storage,
    Network,
    Unknown,
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Module::Accounts => write!(f, "ACCOUNTS"),
            Module::Storage => write!(f, "STORAGE"),
            Module::Network => write!(f, "NETWORK"),
            Module::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

impl From<&str> for Module {
    fn from(value: &str) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "ACCOUNTS" => Module::Accounts,
            "STORAGE" => Module::Storage,
            "NETWORK" => Module::Network,
            _ => Module::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Hook {
    pub name: String,
    pub module: Module,
}

impl Hook {
    pub fn new<S: AsRef<str>>(name: S, module: Module) -> Self {
        Self {
            name: name.as_ref().to_string(),
            module,
        }
    }
}

/// Parses `MODULE::NAME`; a missing half becomes empty / [`Module::Unknown`].
impl From<&str> for Hook {
    fn from(value: &str) -> Self {
        let mut parts = value.splitn(2, "::");
        let module = Module::from(parts.next().unwrap_or_default());
        let name = parts.next().unwrap_or_default().to_string();
        Self { name, module }
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.module, self.name)
    }
}

pub type HookCallback = Box<dyn Fn(&Hook, &serde_json::Value) + Send + Sync>;

#[derive(Default)]
pub struct Hooks {
    hooks: Vec<Hook>,
    subscribers: HashMap<Hook, Vec<HookCallback>>,
}

impl Hooks {
    pub fn create<S: AsRef<str>>(&mut self, name: S, module: Module) -> Result<Hook, HookError> {
        let hook = Hook::new(name, module);
        if self.hooks.contains(&hook) {
            return Err(HookError::DuplicateHook(hook.to_string()));
        }
        self.hooks.push(hook.clone());
        Ok(hook)
    }

    pub fn hooks(&self) -> &[Hook] {
        &self.hooks
    }

    pub fn subscribe<H, F>(&mut self, hook: H, callback: F) -> Result<(), HookError>
    where
        H: Into<Hook>,
        F: Fn(&Hook, &serde_json::Value) + Send + Sync + 'static,
    {
        let hook = hook.into();
        if !self.hooks.contains(&hook) {
            return Err(HookError::HookUnregistered(hook.to_string()));
        }
        self.subscribers
            .entry(hook)
            .or_default()
            .push(Box::new(callback));
        Ok(())
    }

    /// Call every subscriber of `hook`. Returns how many were called.
    pub fn trigger<H: Into<Hook>>(&self, hook: H, data: &serde_json::Value) -> usize {
        let hook = hook.into();
        match self.subscribers.get(&hook) {
            Some(subscribers) => {
                for subscriber in subscribers {
                    subscriber(&hook, data);
                }
                subscribers.len()
            }
            None => 0,
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("hooks", &self.hooks)
            .field("subscribers", &self.subscribers.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}
