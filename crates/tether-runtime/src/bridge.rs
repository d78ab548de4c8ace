//! Bridge context
//!
//! Everything a bound function needs besides its own descriptor: the struct
//! descriptor table, the finalization registry owned handles register with,
//! the fixed-array policy, and the native release function of each owned
//! handle type.

use crate::ffi::caller::{BoundFunction, FunctionDescriptor};
use crate::ffi::error::{FfiError, FfiResult};
use crate::ffi::handle::{Address, Handle, Ownership, TypeTag};
use crate::ffi::layout::DescriptorTable;
use crate::ffi::marshal::{ArrayLengthPolicy, Marshaller};
use crate::ffi::registry::{FinalizationRegistry, NativeRelease, Release};
use std::collections::HashMap;
use std::fmt;
use std::os::raw::c_void;
use std::rc::Rc;
use tether_config::{ArrayLength, Config};

pub struct Bridge {
    table: DescriptorTable,
    registry: FinalizationRegistry,
    policy: ArrayLengthPolicy,
    releasers: HashMap<TypeTag, NativeRelease>,
}

impl Bridge {
    /// Bridge over `table` using the current thread's registry
    pub fn new(table: DescriptorTable) -> Self {
        Self {
            table,
            registry: FinalizationRegistry::current(),
            policy: ArrayLengthPolicy::default(),
            releasers: HashMap::new(),
        }
    }

    /// Apply the marshal and finalization settings of a loaded configuration
    pub fn from_config(table: DescriptorTable, config: &Config) -> Self {
        let bridge = Self::new(table).with_policy(match config.array_length() {
            ArrayLength::Pad => ArrayLengthPolicy::Pad,
            ArrayLength::Strict => ArrayLengthPolicy::Strict,
        });
        bridge.registry.set_warn_on_leak(config.warn_on_leak());
        bridge
    }

    pub fn with_registry(mut self, registry: FinalizationRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_policy(mut self, policy: ArrayLengthPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Register the native function that releases owned handles of `tag`
    pub fn register_release(&mut self, tag: impl Into<TypeTag>, release: NativeRelease) {
        self.releasers.insert(tag.into(), release);
    }

    pub fn release_fn(&self, tag: &TypeTag) -> Option<NativeRelease> {
        self.releasers.get(tag).copied()
    }

    pub fn table(&self) -> &DescriptorTable {
        &self.table
    }

    pub fn registry(&self) -> &FinalizationRegistry {
        &self.registry
    }

    pub fn policy(&self) -> ArrayLengthPolicy {
        self.policy
    }

    pub fn marshaller(&self) -> Marshaller<'_> {
        Marshaller::new(&self.table)
            .with_registry(self.registry.clone())
            .with_policy(self.policy)
    }

    /// Wrap a native address; owned handles use the registered release function
    pub fn wrap(&self, address: Address, tag: TypeTag, owned: bool) -> FfiResult<Handle> {
        let ownership = if owned {
            let release = self
                .release_fn(&tag)
                .ok_or_else(|| FfiError::NoReleaseFunction(tag.clone()))?;
            Ownership::Owned(Release::Native(release))
        } else {
            Ownership::Borrowed
        };
        Ok(self.registry.wrap(address, tag, ownership))
    }

    /// Bind a native function pointer
    ///
    /// # Safety
    ///
    /// See `BoundFunction::new`.
    pub unsafe fn bind(self: &Rc<Self>, descriptor: FunctionDescriptor, code: *const c_void) -> FfiResult<BoundFunction> {
        BoundFunction::new(descriptor, code, Rc::clone(self))
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("policy", &self.policy)
            .field("release_functions", &self.releasers.len())
            .field("registry", &self.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tether_config::{ConfigFile, MarshalSection};

    thread_local! {
        static RELEASED: Cell<usize> = const { Cell::new(0) };
    }

    unsafe extern "C" fn record_release(ptr: *mut c_void) {
        RELEASED.with(|r| r.set(ptr as usize));
    }

    #[test]
    fn test_wrap_owned_uses_registered_release() {
        let mut bridge = Bridge::new(DescriptorTable::default()).with_registry(FinalizationRegistry::new());
        bridge.register_release("CXIndex", record_release);

        let handle = bridge
            .wrap(Address::from_usize(0x77), TypeTag::from_static("CXIndex"), true)
            .unwrap();
        assert_eq!(bridge.registry().pending(), 1);
        handle.release().unwrap();
        assert_eq!(RELEASED.with(|r| r.get()), 0x77);
    }

    #[test]
    fn test_wrap_owned_without_release_fails() {
        let bridge = Bridge::new(DescriptorTable::default());
        let result = bridge.wrap(Address::from_usize(0x1), TypeTag::from_static("CXIndex"), true);
        assert!(matches!(result, Err(FfiError::NoReleaseFunction(_))));
    }

    #[test]
    fn test_from_config_policy() {
        let config = Config {
            file: ConfigFile {
                marshal: Some(MarshalSection {
                    array_length: Some("strict".to_string()),
                }),
                ..Default::default()
            },
            project_root: None,
        };
        let bridge = Bridge::from_config(DescriptorTable::default(), &config);
        assert_eq!(bridge.policy(), ArrayLengthPolicy::Strict);
        assert_eq!(bridge.marshaller().policy(), ArrayLengthPolicy::Strict);
    }
}
