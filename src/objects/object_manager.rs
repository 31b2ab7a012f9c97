#[cfg(feature = "debug_trace_object")]
use log::trace;

use crate::objects::object_class::ObjectClass;
use crate::objects::object_fiber::ObjectFiber;
use crate::objects::object_instance::ObjectInstance;
use crate::objects::object_upvalue::ObjectUpvalue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UpvalueId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId(pub(crate) usize);

/// Owns every mutable heap object. Everything else refers to them through
/// the typed ids handed out by the `alloc_*` methods, which stay valid for
/// the lifetime of the manager.
#[derive(Debug, Default)]
pub struct ObjectManager {
    classes: Vec<ObjectClass>,
    instances: Vec<ObjectInstance>,
    upvalues: Vec<ObjectUpvalue>,
    fibers: Vec<ObjectFiber>,
}

impl ObjectManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_class(&mut self, class: ObjectClass) -> ClassId {
        #[cfg(feature = "debug_trace_object")]
        trace!("alloc class {} ({})", class.name, class.kind);
        self.classes.push(class);
        ClassId(self.classes.len() - 1)
    }

    pub fn alloc_instance(&mut self, instance: ObjectInstance) -> InstanceId {
        #[cfg(feature = "debug_trace_object")]
        trace!("alloc instance of {}", self.classes[instance.class.0].name);
        self.instances.push(instance);
        InstanceId(self.instances.len() - 1)
    }

    pub fn alloc_upvalue(&mut self, upvalue: ObjectUpvalue) -> UpvalueId {
        #[cfg(feature = "debug_trace_object")]
        trace!("alloc upvalue from {}", upvalue.fiber_name);
        self.upvalues.push(upvalue);
        UpvalueId(self.upvalues.len() - 1)
    }

    pub fn alloc_fiber(&mut self, fiber: ObjectFiber) -> FiberId {
        #[cfg(feature = "debug_trace_object")]
        trace!("alloc fiber {}", fiber.name);
        self.fibers.push(fiber);
        FiberId(self.fibers.len() - 1)
    }

    #[inline(always)]
    pub fn class(&self, id: ClassId) -> &ObjectClass {
        &self.classes[id.0]
    }

    #[inline(always)]
    pub fn class_mut(&mut self, id: ClassId) -> &mut ObjectClass {
        &mut self.classes[id.0]
    }

    #[inline(always)]
    pub fn instance(&self, id: InstanceId) -> &ObjectInstance {
        &self.instances[id.0]
    }

    #[inline(always)]
    pub fn instance_mut(&mut self, id: InstanceId) -> &mut ObjectInstance {
        &mut self.instances[id.0]
    }

    #[inline(always)]
    pub fn upvalue(&self, id: UpvalueId) -> &ObjectUpvalue {
        &self.upvalues[id.0]
    }

    #[inline(always)]
    pub fn upvalue_mut(&mut self, id: UpvalueId) -> &mut ObjectUpvalue {
        &mut self.upvalues[id.0]
    }

    #[inline(always)]
    pub fn fiber(&self, id: FiberId) -> &ObjectFiber {
        &self.fibers[id.0]
    }

    #[inline(always)]
    pub fn fiber_mut(&mut self, id: FiberId) -> &mut ObjectFiber {
        &mut self.fibers[id.0]
    }

    /// Depth-first search of the superclass graph for a class named `name`.
    pub fn find_superclass(&self, class: ClassId, name: &str) -> Option<ClassId> {
        for superclass in &self.class(class).superclasses {
            if self.class(*superclass).name.as_ref() == name {
                return Some(*superclass);
            }
            if let Some(found) = self.find_superclass(*superclass, name) {
                return Some(found);
            }
        }
        None
    }

    /// True when `class` is `other` or inherits from it, directly or not.
    pub fn check_is(&self, class: ClassId, other: ClassId) -> bool {
        if class == other {
            return true;
        }
        self.class(class).superclasses.iter().any(|superclass| self.check_is(*superclass, other))
    }
}

#[cfg(test)]
mod tests {
    use super::ObjectManager;
    use crate::objects::object_class::{ClassKind, ObjectClass};

    #[test]
    fn test_check_is_walks_superclasses() {
        let mut heap = ObjectManager::new();
        let a = heap.alloc_class(ObjectClass::new("A", ClassKind::Custom));
        let b = heap.alloc_class(ObjectClass::new("B", ClassKind::Custom));
        let c = heap.alloc_class(ObjectClass::new("C", ClassKind::Custom));
        heap.class_mut(b).superclasses.push(a);
        heap.class_mut(c).superclasses.push(b);

        assert!(heap.check_is(c, a));
        assert!(heap.check_is(c, c));
        assert!(!heap.check_is(a, c));
        assert_eq!(heap.find_superclass(c, "A"), Some(a));
        assert_eq!(heap.find_superclass(a, "C"), None);
    }
}
