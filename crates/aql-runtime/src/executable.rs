//! Code objects, executables and kernel symbols
//!
//! There is no finalizer: a [`CodeObject`] is assembled from host functions
//! with [`CodeObjectBuilder`], loaded into an [`Executable`] for a particular
//! agent, and becomes dispatchable once the executable is frozen. Freezing
//! assigns every loaded kernel a non-zero *kernel object* value, the number a
//! dispatch packet names in `kernel_object`.
//!
//! ```rust
//! use aql_runtime::{CodeObjectBuilder, KernelDescriptor};
//!
//! let code = CodeObjectBuilder::new("aql-sim")
//!     .kernel(KernelDescriptor::new("noop", |_item| {}).with_kernarg(8, 8))
//!     .build()
//!     .unwrap();
//! assert_eq!(code.kernels().count(), 1);
//! ```

use crate::agent::AgentHandle;
use crate::error::{Result, RuntimeError};
use crate::handle::Handle;
use crate::memory::{GlobalMemory, MemoryManager};
use crate::shared::Lifecycle;
use aql_core::constants::KERNARG_MAX_ALIGN;
use aql_core::KernargReader;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Handle to an [`Executable`]
pub type ExecutableHandle = Handle<Executable>;

/// Host function run once per work-item
pub type KernelFn = Arc<dyn Fn(&mut WorkItem<'_>) + Send + Sync>;

// ================================================================================================
// Work-items
// ================================================================================================

/// Execution context of one work-item
///
/// Work-items of a workgroup run one after another on the same thread and see
/// the same group segment; every work-item gets a fresh zeroed private segment.
pub struct WorkItem<'a> {
    pub(crate) global_id: [u32; 3],
    pub(crate) local_id: [u32; 3],
    pub(crate) group_id: [u32; 3],
    pub(crate) workgroup_size: [u16; 3],
    pub(crate) grid_size: [u32; 3],
    pub(crate) kernarg: &'a [u8],
    pub(crate) group_segment: &'a mut [u8],
    pub(crate) private_segment: &'a mut [u8],
    pub(crate) memory: &'a MemoryManager,
}

impl<'a> WorkItem<'a> {
    pub fn global_id(&self) -> [u32; 3] {
        self.global_id
    }

    /// Flattened x-major global id.
    pub fn flat_global_id(&self) -> u64 {
        let [x, y, z] = self.global_id.map(u64::from);
        let [gx, gy, _] = self.grid_size.map(u64::from);
        x + gx * (y + gy * z)
    }

    pub fn local_id(&self) -> [u32; 3] {
        self.local_id
    }

    pub fn group_id(&self) -> [u32; 3] {
        self.group_id
    }

    pub fn workgroup_size(&self) -> [u16; 3] {
        self.workgroup_size
    }

    pub fn grid_size(&self) -> [u32; 3] {
        self.grid_size
    }

    /// Reader positioned at the start of the kernarg segment.
    pub fn kernarg(&self) -> KernargReader<'a> {
        KernargReader::new(self.kernarg)
    }

    pub fn group_segment(&mut self) -> &mut [u8] {
        &mut self.group_segment[..]
    }

    pub fn private_segment(&mut self) -> &mut [u8] {
        &mut self.private_segment[..]
    }

    /// Checked view of runtime-managed global memory.
    pub fn memory(&self) -> GlobalMemory<'a> {
        GlobalMemory::new(self.memory)
    }
}

// ================================================================================================
// Code objects
// ================================================================================================

/// One kernel symbol of a code object
#[derive(Clone)]
pub struct KernelDescriptor {
    name: String,
    kernarg_segment_size: u32,
    kernarg_segment_alignment: u32,
    group_segment_size: u32,
    private_segment_size: u32,
    entry: KernelFn,
}

impl KernelDescriptor {
    /// Kernel with an empty kernarg segment and no segment requirements.
    pub fn new(name: impl Into<String>, entry: impl Fn(&mut WorkItem<'_>) + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            kernarg_segment_size: 0,
            kernarg_segment_alignment: 1,
            group_segment_size: 0,
            private_segment_size: 0,
            entry: Arc::new(entry),
        }
    }

    pub fn with_kernarg(mut self, size: u32, alignment: u32) -> Self {
        self.kernarg_segment_size = size;
        self.kernarg_segment_alignment = alignment;
        self
    }

    pub fn with_group_segment(mut self, size: u32) -> Self {
        self.group_segment_size = size;
        self
    }

    pub fn with_private_segment(mut self, size: u32) -> Self {
        self.private_segment_size = size;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kernarg_segment_size(&self) -> u32 {
        self.kernarg_segment_size
    }

    pub fn kernarg_segment_alignment(&self) -> u32 {
        self.kernarg_segment_alignment
    }

    pub fn group_segment_size(&self) -> u32 {
        self.group_segment_size
    }

    pub fn private_segment_size(&self) -> u32 {
        self.private_segment_size
    }

    pub(crate) fn run(&self, item: &mut WorkItem<'_>) {
        (self.entry)(item)
    }
}

impl fmt::Debug for KernelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelDescriptor")
            .field("name", &self.name)
            .field("kernarg_segment_size", &self.kernarg_segment_size)
            .field("kernarg_segment_alignment", &self.kernarg_segment_alignment)
            .field("group_segment_size", &self.group_segment_size)
            .field("private_segment_size", &self.private_segment_size)
            .finish_non_exhaustive()
    }
}

/// Assembles a [`CodeObject`]
#[derive(Debug)]
pub struct CodeObjectBuilder {
    isa: String,
    kernels: Vec<KernelDescriptor>,
}

impl CodeObjectBuilder {
    pub fn new(isa: impl Into<String>) -> Self {
        Self {
            isa: isa.into(),
            kernels: Vec::new(),
        }
    }

    pub fn kernel(mut self, kernel: KernelDescriptor) -> Self {
        self.kernels.push(kernel);
        self
    }

    /// Validate and seal the code object.
    ///
    /// Every kernarg alignment must be a power of two no larger than 16 and
    /// kernel names must be unique.
    pub fn build(self) -> Result<CodeObject> {
        let mut names = HashSet::new();
        for kernel in &self.kernels {
            let alignment = kernel.kernarg_segment_alignment;
            if !alignment.is_power_of_two() || alignment > KERNARG_MAX_ALIGN {
                return Err(RuntimeError::InvalidCodeObject(format!(
                    "kernel {} has kernarg alignment {alignment}",
                    kernel.name
                )));
            }
            if !names.insert(kernel.name.as_str()) {
                return Err(RuntimeError::InvalidCodeObject(format!(
                    "duplicate kernel {}",
                    kernel.name
                )));
            }
        }
        Ok(CodeObject {
            isa: self.isa,
            kernels: self.kernels.into_iter().map(Arc::new).collect(),
        })
    }
}

/// Validated, loadable set of kernels for one ISA
#[derive(Debug, Clone)]
pub struct CodeObject {
    isa: String,
    kernels: Vec<Arc<KernelDescriptor>>,
}

impl CodeObject {
    pub fn isa(&self) -> &str {
        &self.isa
    }

    pub fn kernels(&self) -> impl Iterator<Item = &KernelDescriptor> {
        self.kernels.iter().map(Arc::as_ref)
    }
}

// ================================================================================================
// Executables
// ================================================================================================

/// Attributes of one kernel symbol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolInfo {
    pub name: String,
    pub agent: AgentHandle,
    /// 0 until the executable is frozen.
    pub kernel_object: u64,
    pub kernarg_segment_size: u32,
    pub kernarg_segment_alignment: u32,
    pub group_segment_size: u32,
    pub private_segment_size: u32,
}

struct LoadedKernel {
    agent: AgentHandle,
    kernel: Arc<KernelDescriptor>,
    kernel_object: u64,
}

impl LoadedKernel {
    fn info(&self) -> SymbolInfo {
        SymbolInfo {
            name: self.kernel.name.clone(),
            agent: self.agent,
            kernel_object: self.kernel_object,
            kernarg_segment_size: self.kernel.kernarg_segment_size,
            kernarg_segment_alignment: self.kernel.kernarg_segment_alignment,
            group_segment_size: self.kernel.group_segment_size,
            private_segment_size: self.kernel.private_segment_size,
        }
    }
}

#[derive(Default)]
struct ExecutableState {
    frozen: bool,
    kernels: Vec<LoadedKernel>,
}

/// Code objects loaded for specific agents
pub struct Executable {
    handle: ExecutableHandle,
    state: RwLock<ExecutableState>,
    lifecycle: Arc<Lifecycle>,
}

impl Executable {
    pub(crate) fn new(handle: ExecutableHandle, lifecycle: Arc<Lifecycle>) -> Self {
        Self {
            handle,
            state: RwLock::new(ExecutableState::default()),
            lifecycle,
        }
    }

    pub fn handle(&self) -> ExecutableHandle {
        self.handle
    }

    pub fn is_frozen(&self) -> bool {
        self.state.read().frozen
    }

    /// Add every kernel of `code` for `agent`, whose ISA has already been
    /// checked against the code object.
    pub(crate) fn load(&self, agent: AgentHandle, code: &CodeObject) -> Result<()> {
        self.lifecycle.ensure_alive()?;
        let mut state = self.state.write();
        if state.frozen {
            return Err(RuntimeError::FrozenExecutable);
        }
        for kernel in &code.kernels {
            let duplicate = state
                .kernels
                .iter()
                .any(|loaded| loaded.agent == agent && loaded.kernel.name == kernel.name);
            if duplicate {
                return Err(RuntimeError::InvalidCodeObject(format!(
                    "kernel {} is already loaded for agent {agent}",
                    kernel.name
                )));
            }
        }
        state.kernels.extend(code.kernels.iter().map(|kernel| LoadedKernel {
            agent,
            kernel: Arc::clone(kernel),
            kernel_object: 0,
        }));
        Ok(())
    }

    /// Assign kernel objects and publish them to `table`.
    pub(crate) fn freeze(&self, table: &KernelTable, mut next_object: impl FnMut() -> u64) -> Result<()> {
        self.lifecycle.ensure_alive()?;
        let mut state = self.state.write();
        if state.frozen {
            return Err(RuntimeError::FrozenExecutable);
        }
        for loaded in &mut state.kernels {
            loaded.kernel_object = next_object();
            table.insert(loaded.kernel_object, Arc::clone(&loaded.kernel));
        }
        state.frozen = true;
        Ok(())
    }

    /// Withdraw this executable's kernel objects from `table`.
    pub(crate) fn unregister(&self, table: &KernelTable) {
        for loaded in &self.state.read().kernels {
            if loaded.kernel_object != 0 {
                table.remove(loaded.kernel_object);
            }
        }
    }

    pub fn symbol(&self, name: &str, agent: AgentHandle) -> Result<SymbolInfo> {
        self.lifecycle.ensure_alive()?;
        self.state
            .read()
            .kernels
            .iter()
            .find(|loaded| loaded.agent == agent && loaded.kernel.name == name)
            .map(LoadedKernel::info)
            .ok_or_else(|| RuntimeError::InvalidSymbolName(name.to_string()))
    }

    fn nth_symbol(&self, nth: usize) -> Option<SymbolInfo> {
        self.state.read().kernels.get(nth).map(LoadedKernel::info)
    }
}

impl fmt::Debug for Executable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("Executable")
            .field("handle", &self.handle)
            .field("frozen", &state.frozen)
            .field("kernels", &state.kernels.len())
            .finish()
    }
}

/// Lazy iterator over the symbols of an executable, in load order
#[derive(Clone)]
pub struct SymbolIter {
    executable: Arc<Executable>,
    position: usize,
}

impl SymbolIter {
    pub(crate) fn new(executable: Arc<Executable>) -> Self {
        Self {
            executable,
            position: 0,
        }
    }
}

impl Iterator for SymbolIter {
    type Item = SymbolInfo;

    fn next(&mut self) -> Option<Self::Item> {
        let symbol = self.executable.nth_symbol(self.position)?;
        self.position += 1;
        Some(symbol)
    }
}

// ================================================================================================
// Kernel table
// ================================================================================================

/// Kernel objects of every frozen executable, as seen by command processors
#[derive(Default)]
pub(crate) struct KernelTable {
    kernels: RwLock<HashMap<u64, Arc<KernelDescriptor>>>,
}

impl KernelTable {
    pub(crate) fn insert(&self, kernel_object: u64, kernel: Arc<KernelDescriptor>) {
        self.kernels.write().insert(kernel_object, kernel);
    }

    pub(crate) fn remove(&self, kernel_object: u64) {
        self.kernels.write().remove(&kernel_object);
    }

    pub(crate) fn get(&self, kernel_object: u64) -> Option<Arc<KernelDescriptor>> {
        self.kernels.read().get(&kernel_object).cloned()
    }

    pub(crate) fn clear(&self) {
        self.kernels.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(name: &str) -> KernelDescriptor {
        KernelDescriptor::new(name, |_item| {})
    }

    #[test]
    fn test_builder_rejects_bad_alignment() {
        for alignment in [0, 3, 32] {
            let err = CodeObjectBuilder::new("aql-sim")
                .kernel(noop("k").with_kernarg(8, alignment))
                .build()
                .unwrap_err();
            assert!(matches!(err, RuntimeError::InvalidCodeObject(_)), "{alignment}");
        }
        assert!(CodeObjectBuilder::new("aql-sim")
            .kernel(noop("k").with_kernarg(8, 16))
            .build()
            .is_ok());
    }

    #[test]
    fn test_builder_rejects_duplicate_names() {
        let err = CodeObjectBuilder::new("aql-sim")
            .kernel(noop("k"))
            .kernel(noop("k"))
            .build()
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidCodeObject(_)));
    }

    #[test]
    fn test_freeze_assigns_objects_once() {
        let lifecycle = Arc::new(Lifecycle::new());
        let exe = Executable::new(Handle::from_raw(1 << 32), lifecycle);
        let agent = Handle::from_raw(1 << 32);
        let code = CodeObjectBuilder::new("aql-sim")
            .kernel(noop("a"))
            .kernel(noop("b"))
            .build()
            .unwrap();
        exe.load(agent, &code).unwrap();
        assert_eq!(exe.symbol("a", agent).unwrap().kernel_object, 0);

        let table = KernelTable::default();
        let mut next = 0x1000;
        exe.freeze(&table, || {
            next += 0x40;
            next
        })
        .unwrap();
        let a = exe.symbol("a", agent).unwrap().kernel_object;
        let b = exe.symbol("b", agent).unwrap().kernel_object;
        assert!(a != 0 && b != 0 && a != b);
        assert!(table.get(a).is_some());

        assert_eq!(exe.freeze(&table, || 1), Err(RuntimeError::FrozenExecutable));
        assert_eq!(exe.load(agent, &code), Err(RuntimeError::FrozenExecutable));

        exe.unregister(&table);
        assert!(table.get(a).is_none());
    }

    #[test]
    fn test_symbol_iter_restarts() {
        let exe = Arc::new(Executable::new(Handle::from_raw(1 << 32), Arc::new(Lifecycle::new())));
        let agent = Handle::from_raw(1 << 32);
        let code = CodeObjectBuilder::new("aql-sim").kernel(noop("x")).kernel(noop("y")).build().unwrap();
        exe.load(agent, &code).unwrap();

        let iter = SymbolIter::new(Arc::clone(&exe));
        let names: Vec<_> = iter.clone().map(|s| s.name).collect();
        assert_eq!(names, ["x", "y"]);
        assert_eq!(iter.take(1).count(), 1);
        assert!(matches!(exe.symbol("z", agent), Err(RuntimeError::InvalidSymbolName(_))));
    }
}
