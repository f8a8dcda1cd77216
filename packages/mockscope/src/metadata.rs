//! Static program metadata consulted while matching stack frames.
//!
//! The catalog stands in for runtime reflection: it records modules, classes
//! and methods together with the structural markers (attributes) attached to
//! them, the async state-machine links the normalizer follows, and the set of
//! marker types that are actually defined in the running process.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::ids::{ClassId, MethodId, ModuleId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodKind {
    Method,
    Constructor,
    StaticConstructor,
}

impl MethodKind {
    pub fn is_constructor(self) -> bool {
        matches!(self, MethodKind::Constructor | MethodKind::StaticConstructor)
    }
}

#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pub id: ModuleId,
    pub name: String,
    /// Code belonging to the mocking system itself; skipped when picking the
    /// caller for the local fallback store.
    pub internal: bool,
}

#[derive(Debug, Clone)]
pub struct ClassInfo {
    pub id: ClassId,
    pub name: String,
    pub module: ModuleId,
    pub base: Option<ClassId>,
    /// Lexically enclosing class, set for nested and synthesized classes.
    pub enclosing: Option<ClassId>,
    /// Compiler-synthesized continuation type implementing the async state
    /// machine capability.
    pub is_async_state_machine: bool,
    pub markers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MethodInfo {
    pub id: MethodId,
    pub name: String,
    pub class: ClassId,
    pub kind: MethodKind,
    pub markers: Vec<String>,
    /// For async methods: the synthesized class holding the method body.
    pub state_machine: Option<ClassId>,
}

impl MethodInfo {
    pub fn has_marker(&self, marker: &str) -> bool {
        self.markers.iter().any(|m| m == marker)
    }
}

/// Immutable view of the running program's declared structure.
#[derive(Debug, Default)]
pub struct MetadataCatalog {
    modules: HashMap<ModuleId, ModuleInfo>,
    classes: HashMap<ClassId, ClassInfo>,
    methods: HashMap<MethodId, MethodInfo>,
    methods_by_class: HashMap<ClassId, Vec<MethodId>>,
    defined_markers: HashSet<String>,
}

impl MetadataCatalog {
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::new()
    }

    pub fn module(&self, id: ModuleId) -> Option<&ModuleInfo> {
        self.modules.get(&id)
    }

    pub fn class(&self, id: ClassId) -> Option<&ClassInfo> {
        self.classes.get(&id)
    }

    pub fn method(&self, id: MethodId) -> Option<&MethodInfo> {
        self.methods.get(&id)
    }

    pub fn methods_of(&self, class: ClassId) -> impl Iterator<Item = &MethodInfo> {
        self.methods_by_class
            .get(&class)
            .into_iter()
            .flatten()
            .filter_map(|id| self.methods.get(id))
    }

    pub fn class_of(&self, method: MethodId) -> Option<ClassId> {
        self.methods.get(&method).map(|info| info.class)
    }

    pub fn module_of(&self, method: MethodId) -> Option<ModuleId> {
        let class = self.class_of(method)?;
        self.classes.get(&class).map(|info| info.module)
    }

    pub fn module_by_name(&self, name: &str) -> Option<ModuleId> {
        self.modules
            .values()
            .find(|info| info.name == name)
            .map(|info| info.id)
    }

    pub fn class_by_name(&self, name: &str) -> Option<ClassId> {
        self.classes
            .values()
            .find(|info| info.name == name)
            .map(|info| info.id)
    }

    pub fn method_by_name(&self, class: ClassId, name: &str) -> Option<MethodId> {
        self.methods_of(class)
            .find(|info| info.name == name)
            .map(|info| info.id)
    }

    pub fn is_internal(&self, method: MethodId) -> bool {
        self.module_of(method)
            .and_then(|module| self.modules.get(&module))
            .is_some_and(|info| info.internal)
    }

    /// Whether a marker type can be located in the running process.
    pub fn is_marker_defined(&self, marker: &str) -> bool {
        self.defined_markers.contains(marker)
    }

    pub fn has_marker(&self, method: MethodId, marker: &str) -> bool {
        self.methods
            .get(&method)
            .is_some_and(|info| info.has_marker(marker))
    }

    /// `child` equals `ancestor` or derives from it through the base chain.
    pub fn is_subclass_of(&self, child: ClassId, ancestor: ClassId) -> bool {
        let mut current = Some(child);
        let mut hops = 0usize;
        while let Some(class) = current {
            if class == ancestor {
                return true;
            }
            // Base chains are acyclic when built through CatalogBuilder; the
            // bound only guards hand-assembled metadata.
            hops += 1;
            if hops > self.classes.len() {
                return false;
            }
            current = self.classes.get(&class).and_then(|info| info.base);
        }
        false
    }

    /// Whether `class` or one of its bases declares a method carrying any of
    /// `markers`.
    pub fn declares_marked_method(&self, class: ClassId, markers: &[String]) -> bool {
        let mut current = Some(class);
        let mut hops = 0usize;
        while let Some(id) = current {
            if self
                .methods_of(id)
                .any(|method| markers.iter().any(|marker| method.has_marker(marker)))
            {
                return true;
            }
            hops += 1;
            if hops > self.classes.len() {
                return false;
            }
            current = self.classes.get(&id).and_then(|info| info.base);
        }
        false
    }
}

/// Incremental builder assigning ids as the program structure is declared.
#[derive(Debug)]
pub struct CatalogBuilder {
    catalog: MetadataCatalog,
    next_id: u64,
    state_machine_seq: u64,
}

impl CatalogBuilder {
    pub fn new() -> Self {
        CatalogBuilder {
            catalog: MetadataCatalog::default(),
            next_id: 1,
            state_machine_seq: 0,
        }
    }

    fn fresh(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn module(&mut self, name: &str) -> ModuleId {
        self.add_module(name, false)
    }

    pub fn internal_module(&mut self, name: &str) -> ModuleId {
        self.add_module(name, true)
    }

    fn add_module(&mut self, name: &str, internal: bool) -> ModuleId {
        let id = ModuleId(self.fresh());
        self.catalog.modules.insert(
            id,
            ModuleInfo {
                id,
                name: name.to_string(),
                internal,
            },
        );
        id
    }

    pub fn class(&mut self, module: ModuleId, name: &str) -> ClassId {
        self.add_class(module, name, None, None, false)
    }

    pub fn derived_class(&mut self, module: ModuleId, name: &str, base: ClassId) -> ClassId {
        self.add_class(module, name, Some(base), None, false)
    }

    pub fn nested_class(&mut self, enclosing: ClassId, name: &str) -> ClassId {
        let module = self.module_of_class(enclosing);
        self.add_class(module, name, None, Some(enclosing), false)
    }

    /// Declare a synthesized state-machine class without linking it to an
    /// owning method. Async methods use [`CatalogBuilder::async_method`].
    pub fn state_machine_class(&mut self, enclosing: ClassId, name: &str) -> ClassId {
        let module = self.module_of_class(enclosing);
        self.add_class(module, name, None, Some(enclosing), true)
    }

    fn module_of_class(&self, class: ClassId) -> ModuleId {
        self.catalog
            .classes
            .get(&class)
            .map(|info| info.module)
            .unwrap_or(ModuleId(0))
    }

    fn add_class(
        &mut self,
        module: ModuleId,
        name: &str,
        base: Option<ClassId>,
        enclosing: Option<ClassId>,
        is_async_state_machine: bool,
    ) -> ClassId {
        let id = ClassId(self.fresh());
        self.catalog.classes.insert(
            id,
            ClassInfo {
                id,
                name: name.to_string(),
                module,
                base,
                enclosing,
                is_async_state_machine,
                markers: Vec::new(),
            },
        );
        id
    }

    pub fn method(&mut self, class: ClassId, name: &str) -> MethodId {
        self.add_method(class, name, MethodKind::Method)
    }

    pub fn constructor(&mut self, class: ClassId) -> MethodId {
        self.add_method(class, ".ctor", MethodKind::Constructor)
    }

    pub fn static_constructor(&mut self, class: ClassId) -> MethodId {
        self.add_method(class, ".cctor", MethodKind::StaticConstructor)
    }

    fn add_method(&mut self, class: ClassId, name: &str, kind: MethodKind) -> MethodId {
        let id = MethodId(self.fresh());
        self.catalog.methods.insert(
            id,
            MethodInfo {
                id,
                name: name.to_string(),
                class,
                kind,
                markers: Vec::new(),
                state_machine: None,
            },
        );
        self.catalog
            .methods_by_class
            .entry(class)
            .or_default()
            .push(id);
        id
    }

    /// Declare an async method: returns the declared method and the
    /// continuation method (`MoveNext`) of its synthesized state machine.
    pub fn async_method(&mut self, class: ClassId, name: &str) -> (MethodId, MethodId) {
        let declared = self.method(class, name);
        self.state_machine_seq += 1;
        let module = self.module_of_class(class);
        let machine_name = format!("<{name}>d__{}", self.state_machine_seq);
        let machine = self.add_class(module, &machine_name, None, Some(class), true);
        let move_next = self.add_method(machine, "MoveNext", MethodKind::Method);
        if let Some(info) = self.catalog.methods.get_mut(&declared) {
            info.state_machine = Some(machine);
        }
        (declared, move_next)
    }

    /// Attach a structural marker to a method.
    pub fn mark(&mut self, method: MethodId, marker: &str) -> &mut Self {
        if let Some(info) = self.catalog.methods.get_mut(&method) {
            info.markers.push(marker.to_string());
        }
        self
    }

    pub fn mark_class(&mut self, class: ClassId, marker: &str) -> &mut Self {
        if let Some(info) = self.catalog.classes.get_mut(&class) {
            info.markers.push(marker.to_string());
        }
        self
    }

    /// Record that a marker type is loaded in the running process.
    pub fn define_marker(&mut self, marker: &str) -> &mut Self {
        self.catalog.defined_markers.insert(marker.to_string());
        self
    }

    pub fn define_markers<'a>(&mut self, markers: impl IntoIterator<Item = &'a str>) -> &mut Self {
        for marker in markers {
            self.define_marker(marker);
        }
        self
    }

    pub fn build(self) -> MetadataCatalog {
        self.catalog
    }
}

impl Default for CatalogBuilder {
    fn default() -> Self {
        Self::new()
    }
}
