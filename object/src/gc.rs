use crate::{ObjectMemory, Oop, Value};

/// Supplies the strong roots of a collection.
pub trait RootProvider {
    fn visit_roots(&self, visitor: &mut dyn FnMut(Value));
}

impl RootProvider for Vec<Value> {
    fn visit_roots(&self, visitor: &mut dyn FnMut(Value)) {
        for &value in self.iter() {
            visitor(value);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub live: usize,
    pub freed: usize,
    pub weak_cleared: usize,
}

impl ObjectMemory {
    /// Stop-the-world mark and sweep.
    ///
    /// Freed indices go to the free list; weak slots naming freed objects
    /// become nil. Callers must hold every live reference either in the
    /// heap or in `roots`.
    pub fn collect(&mut self, roots: &dyn RootProvider) -> GcStats {
        let mut marks = vec![false; self.objects.len()];
        let mut stack: Vec<Oop> = Vec::new();
        roots.visit_roots(&mut |value| {
            if let Value::Object(oop) = value {
                stack.push(oop);
            }
        });
        if let Value::Object(nil) = self.nil() {
            stack.push(nil);
        }

        while let Some(oop) = stack.pop() {
            let index = oop.index();
            if index >= marks.len() || marks[index] {
                continue;
            }
            let Some(object) = &self.objects[index] else {
                continue;
            };
            marks[index] = true;
            stack.push(object.class);
            for value in &object.named {
                if let Value::Object(child) = value {
                    stack.push(*child);
                }
            }
            object.storage.for_each_strong(|child| stack.push(child));
        }

        let mut stats = GcStats::default();
        for (index, slot) in self.objects.iter_mut().enumerate() {
            if slot.is_none() {
                continue;
            }
            if marks[index] {
                stats.live += 1;
            } else {
                *slot = None;
                self.free.push(index as u32);
                stats.freed += 1;
            }
        }

        let nil = self.nil();
        for object in self.objects.iter_mut().flatten() {
            stats.weak_cleared += object
                .storage
                .clear_dead_weak(|oop| marks.get(oop.index()).copied().unwrap_or(false), nil);
        }

        self.allocations = 0;
        log::debug!(
            "gc: {} live, {} freed, {} weak slots cleared",
            stats.live,
            stats.freed,
            stats.weak_cleared
        );
        stats
    }
}
