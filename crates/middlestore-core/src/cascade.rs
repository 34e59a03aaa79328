//! Delete planning and application.
//!
//! Deleting an object walks the reference graph in both directions, guided by
//! each attribute's [`DeletePolicy`]:
//!
//! - objects whose attribute points *at* a deleted object follow that
//!   attribute's `on_delete_other` policy;
//! - objects a deleted object points *to* follow the `on_delete_self` policy.
//!
//! The whole plan is computed before anything is touched, so a denied delete
//! leaves the store unchanged.

use std::sync::Arc;

use crate::error::{
    DeleteObjectWithReferencesError, DeleteReferencedError, Error, LifecycleErrorKind,
    ReferenceViolation, Result, lifecycle_error,
};
use crate::model::{Attr, DeletePolicy};
use crate::object::{Lifecycle, ObjectHandle};
use crate::per_thread::IdentitySet;
use crate::store::ObjectStore;

/// A reference to be nulled out once the delete is applied.
struct Detach {
    object: ObjectHandle,
    attr: Arc<Attr>,
}

#[derive(Default)]
struct DeletePlan {
    to_delete: IdentitySet,
    detaches: Vec<Detach>,
    /// Referencing objects whose `on_delete_other` is deny.
    ref_denials: Vec<ReferenceViolation>,
    /// Referenced objects whose referencing attr has `on_delete_self` deny.
    self_denials: Vec<ReferenceViolation>,
}

impl DeletePlan {
    /// Drop candidates that are themselves being deleted.
    fn prune(&mut self) {
        let to_delete = &self.to_delete;
        self.detaches.retain(|d| !to_delete.contains(&d.object));
        self.ref_denials.retain(|v| !to_delete.contains(&v.referencing));
        self.self_denials.retain(|v| !to_delete.contains(&v.referenced));
    }
}

impl ObjectStore {
    /// Delete `target` along with whatever its delete policies pull in.
    ///
    /// Fails with [`Error::DeleteReferenced`] when an object outside the
    /// delete set refers into it with a deny policy, or
    /// [`Error::DeleteObjectWithReferences`] when a deleted object's own deny
    /// policy forbids leaving something behind. Storage is updated on the
    /// next save.
    #[tracing::instrument(level = "debug", skip_all, fields(target = %target.describe()))]
    pub fn delete_object(&self, target: &ObjectHandle) -> Result<()> {
        match target.lifecycle() {
            Lifecycle::Committed | Lifecycle::PendingInsert if self.owns(target) => {}
            Lifecycle::Deleted => {
                return Err(lifecycle_error(
                    LifecycleErrorKind::Deleted,
                    target.describe(),
                    "object is already deleted",
                ));
            }
            _ => {
                return Err(lifecycle_error(
                    LifecycleErrorKind::NotInStore,
                    target.describe(),
                    "object is not in this store",
                ));
            }
        }

        let mut plan = self.plan_delete(target)?;
        plan.prune();

        if !plan.ref_denials.is_empty() {
            tracing::debug!(violations = plan.ref_denials.len(), "Delete denied by referencing objects");
            return Err(Error::DeleteReferenced(DeleteReferencedError {
                target: Arc::clone(target),
                violations: plan.ref_denials,
            }));
        }
        if !plan.self_denials.is_empty() {
            tracing::debug!(violations = plan.self_denials.len(), "Delete denied by own references");
            return Err(Error::DeleteObjectWithReferences(
                DeleteObjectWithReferencesError {
                    target: Arc::clone(target),
                    violations: plan.self_denials,
                },
            ));
        }

        self.apply_delete(&plan);
        tracing::info!(
            deleted = plan.to_delete.len(),
            detached = plan.detaches.len(),
            "Objects deleted"
        );
        Ok(())
    }

    fn plan_delete(&self, target: &ObjectHandle) -> Result<DeletePlan> {
        let mut plan = DeletePlan::default();
        let mut stack = vec![Arc::clone(target)];

        while let Some(object) = stack.pop() {
            if !plan.to_delete.insert(&object) {
                continue;
            }

            for (referencing, attr) in self.referencing_objects(&object)? {
                tracing::debug!(
                    object = %object.describe(),
                    referencing = %referencing.describe(),
                    attr = attr.name(),
                    policy = %attr.on_delete_other(),
                    "Incoming reference"
                );
                match attr.on_delete_other() {
                    DeletePolicy::Cascade => stack.push(referencing),
                    DeletePolicy::Deny => plan.ref_denials.push(ReferenceViolation {
                        referencing,
                        attr: attr.name().to_string(),
                        referenced: Arc::clone(&object),
                    }),
                    DeletePolicy::Detach => plan.detaches.push(Detach {
                        object: referencing,
                        attr,
                    }),
                }
            }

            for attr in object.klass().all_attrs() {
                for referenced in referenced_via(&object, attr)? {
                    tracing::debug!(
                        object = %object.describe(),
                        referenced = %referenced.describe(),
                        attr = attr.name(),
                        policy = %attr.on_delete_self(),
                        "Outgoing reference"
                    );
                    match attr.on_delete_self() {
                        DeletePolicy::Cascade => stack.push(referenced),
                        DeletePolicy::Deny => plan.self_denials.push(ReferenceViolation {
                            referencing: Arc::clone(&object),
                            attr: attr.name().to_string(),
                            referenced,
                        }),
                        DeletePolicy::Detach => {}
                    }
                }
            }
        }
        Ok(plan)
    }

    fn apply_delete(&self, plan: &DeletePlan) {
        for detach in &plan.detaches {
            detach.object.detach_attr(&detach.attr);
            self.object_changed(&detach.object);
        }
        for object in plan.to_delete.iter() {
            self.schedule_delete(object);
        }
        for object in self.live_objects() {
            object.forget_list_members(&|member: &ObjectHandle| plan.to_delete.contains(member));
        }
    }
}

/// Live objects `object.attr` points at. Dangling stored references are
/// skipped.
fn referenced_via(object: &ObjectHandle, attr: &Arc<Attr>) -> Result<Vec<ObjectHandle>> {
    let referenced = if attr.is_obj_ref() {
        match object.get_object(attr.name()) {
            Ok(found) => found.into_iter().collect(),
            Err(Error::ObjRefDangles(e) | Error::ObjRefZeroSerialNum(e)) => {
                tracing::debug!(
                    object = %object.describe(),
                    attr = attr.name(),
                    obj_ref = %e.obj_ref,
                    "Skipping unresolvable reference"
                );
                Vec::new()
            }
            Err(e) => return Err(e),
        }
    } else if attr.is_list() {
        object.list(attr.name())?
    } else {
        return Ok(Vec::new());
    };
    Ok(referenced.into_iter().filter(|o| !o.is_deleted()).collect())
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttrDef, KlassDef, Model, ModelBuilder};
    use crate::object::FieldValue;
    use crate::persistence::MemoryPersistence;
    use crate::settings::StoreSettings;

    /// `Order.customer` is deny-on-other; `Order.invoice` cascades to the
    /// invoice; `Note.order` detaches; `Line.order` cascades from the order.
    fn shop() -> Arc<Model> {
        ModelBuilder::new("Shop")
            .klass(KlassDef::new("Customer").attr(AttrDef::string("name")))
            .klass(KlassDef::new("Invoice").attr(AttrDef::int("total")))
            .klass(
                KlassDef::new("Order")
                    .attr(AttrDef::obj_ref("customer", "Customer"))
                    .attr(
                        AttrDef::obj_ref("invoice", "Invoice")
                            .on_delete_self(DeletePolicy::Cascade),
                    )
                    .attr(AttrDef::list("lines", "Line", "order").on_delete_self(DeletePolicy::Cascade)),
            )
            .klass(
                KlassDef::new("Line")
                    .attr(AttrDef::obj_ref("order", "Order").on_delete_other(DeletePolicy::Cascade)),
            )
            .klass(
                KlassDef::new("Note")
                    .attr(AttrDef::obj_ref("order", "Order").on_delete_other(DeletePolicy::Detach)),
            )
            .build()
            .unwrap()
    }

    fn store() -> Arc<ObjectStore> {
        ObjectStore::new(
            shop(),
            StoreSettings::default().cache_objects_forever(true),
            MemoryPersistence::new(),
        )
        .unwrap()
    }

    fn saved(store: &ObjectStore, klass: &str) -> ObjectHandle {
        let object = store.create_object(klass).unwrap();
        store.add_object(&object).unwrap();
        object
    }

    #[test]
    fn test_cascade_through_self_policy() {
        let store = store();
        let order = saved(&store, "Order");
        let invoice = saved(&store, "Invoice");
        order.set("invoice", &invoice).unwrap();
        store.save_changes().unwrap();

        store.delete_object(&order).unwrap();
        assert!(order.is_deleted());
        assert!(invoice.is_deleted());
        assert_eq!(store.debug_info().pending_delete, 2);
        store.save_changes().unwrap();
        assert!(store.fetch_object_opt("Invoice", invoice.serial_num()).unwrap().is_none());
    }

    #[test]
    fn test_deny_blocks_until_referrer_is_gone() {
        // Customer referenced by an order whose `customer` attr denies.
        let store = store();
        let customer = saved(&store, "Customer");
        let order = saved(&store, "Order");
        order.set("customer", &customer).unwrap();
        store.save_changes().unwrap();

        let err = store.delete_object(&customer).unwrap_err();
        match err {
            Error::DeleteReferenced(e) => {
                assert_eq!(e.violations.len(), 1);
                assert!(Arc::ptr_eq(&e.violations[0].referencing, &order));
                assert_eq!(e.violations[0].attr, "customer");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!customer.is_deleted());
        assert!(!store.has_changes());

        store.delete_object(&order).unwrap();
        store.delete_object(&customer).unwrap();
        store.save_changes().unwrap();
    }

    #[test]
    fn test_detach_nulls_incoming_reference() {
        let store = store();
        let order = saved(&store, "Order");
        let note = saved(&store, "Note");
        note.set("order", &order).unwrap();
        store.save_changes().unwrap();

        store.delete_object(&order).unwrap();
        assert!(!note.is_deleted());
        assert!(note.get_object("order").unwrap().is_none());
        assert_eq!(note.changed_attrs(), vec!["order".to_string()]);
        store.save_changes().unwrap();
    }

    #[test]
    fn test_cascade_from_other_side_and_lists() {
        let store = store();
        let order = saved(&store, "Order");
        let a = store.create_object("Line").unwrap();
        let b = store.create_object("Line").unwrap();
        order.add_to_list("lines", &a).unwrap();
        order.add_to_list("lines", &b).unwrap();
        assert_eq!(a.lifecycle(), Lifecycle::PendingInsert);
        store.save_changes().unwrap();
        assert_eq!(order.list("lines").unwrap().len(), 2);

        store.delete_object(&a).unwrap();
        assert_eq!(order.list("lines").unwrap().len(), 1);

        store.delete_object(&order).unwrap();
        assert!(b.is_deleted());
        store.save_changes().unwrap();
    }

    #[test]
    fn test_self_deny() {
        let model = ModelBuilder::new("M")
            .klass(KlassDef::new("Target"))
            .klass(
                KlassDef::new("Holder").attr(
                    AttrDef::obj_ref("target", "Target")
                        .on_delete_self(DeletePolicy::Deny)
                        .on_delete_other(DeletePolicy::Detach),
                ),
            )
            .build()
            .unwrap();
        let store = ObjectStore::in_memory(model).unwrap();
        let holder = saved(&store, "Holder");
        let target = saved(&store, "Target");
        holder.set("target", &target).unwrap();
        store.save_changes().unwrap();

        let err = store.delete_object(&holder).unwrap_err();
        assert!(matches!(err, Error::DeleteObjectWithReferences(ref e) if e.violations.len() == 1));
        assert!(!holder.is_deleted());

        store.delete_object(&target).unwrap();
        assert!(matches!(holder.raw_value(holder.klass().attr("target").unwrap()), FieldValue::Null));
        store.delete_object(&holder).unwrap();
    }

    #[test]
    fn test_cycles_terminate() {
        let model = ModelBuilder::new("M")
            .klass(
                KlassDef::new("Node").attr(
                    AttrDef::obj_ref("next", "Node")
                        .on_delete_self(DeletePolicy::Cascade)
                        .on_delete_other(DeletePolicy::Cascade),
                ),
            )
            .build()
            .unwrap();
        let store = ObjectStore::in_memory(model).unwrap();
        let x = saved(&store, "Node");
        let y = saved(&store, "Node");
        x.set("next", &y).unwrap();
        y.set("next", &x).unwrap();
        store.save_changes().unwrap();

        store.delete_object(&x).unwrap();
        assert!(x.is_deleted());
        assert!(y.is_deleted());
    }

    #[test]
    fn test_deleting_unsaved_object_drops_insert() {
        let store = store();
        let customer = saved(&store, "Customer");
        store.delete_object(&customer).unwrap();
        assert!(customer.is_deleted());
        assert!(!store.has_changes());
        assert!(store.delete_object(&customer).is_err());
    }
}
