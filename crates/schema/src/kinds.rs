//! Registered kinds: one `TypedObject` variant and one scheme entry per type.

use k8s_openapi::api::{
    apps::v1 as appsv1, batch::v1 as batchv1, core::v1 as corev1, events::v1 as eventsv1,
    networking::v1 as networkingv1, rbac::v1 as rbacv1, storage::v1 as storagev1,
};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1 as apiextensionsv1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kestrel_core::Gvk;
use kube::Resource;

use crate::{ClusterObject, Collectable, SchemeEntry};

pub(crate) fn gvk_of<K: Resource<DynamicType = ()>>() -> Gvk {
    Gvk::new(K::group(&()), K::version(&()), K::kind(&()))
}

macro_rules! scope_namespaced {
    (namespaced) => { true };
    (cluster) => { false };
}

macro_rules! registered_kinds {
    ($( $variant:ident => $ty:ty, $scope:ident; )+) => {
        /// A strongly-typed object of one of the registered kinds.
        #[derive(Debug, Clone)]
        pub enum TypedObject {
            $( $variant($ty), )+
        }

        impl TypedObject {
            pub fn meta(&self) -> &ObjectMeta {
                match self { $( Self::$variant(o) => o.meta(), )+ }
            }

            pub fn meta_mut(&mut self) -> &mut ObjectMeta {
                match self { $( Self::$variant(o) => o.meta_mut(), )+ }
            }

            /// Kind identifier derived from the variant, never from wire data.
            pub fn gvk(&self) -> Gvk {
                match self { $( Self::$variant(_) => gvk_of::<$ty>(), )+ }
            }

            /// Serialized form; `apiVersion` and `kind` are always written.
            pub fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
                match self { $( Self::$variant(o) => serde_json::to_value(o), )+ }
            }
        }

        $(
            impl From<$ty> for TypedObject {
                fn from(o: $ty) -> Self { Self::$variant(o) }
            }

            impl Collectable for $ty {
                fn from_object(obj: &ClusterObject) -> Option<Self> {
                    match obj {
                        ClusterObject::Typed(TypedObject::$variant(o)) => Some(o.clone()),
                        _ => None,
                    }
                }

                fn uid(&self) -> Option<&str> { self.meta().uid.as_deref() }
            }
        )+

        pub(crate) fn builtin_entries() -> Vec<SchemeEntry> {
            vec![
                $(
                    SchemeEntry {
                        gvk: gvk_of::<$ty>(),
                        plural: <$ty as Resource>::plural(&()).to_string(),
                        namespaced: scope_namespaced!($scope),
                        decode: |v| serde_json::from_value::<$ty>(v).map(TypedObject::$variant),
                    },
                )+
            ]
        }
    };
}

registered_kinds! {
    // core/v1
    Pod => corev1::Pod, namespaced;
    Service => corev1::Service, namespaced;
    ConfigMap => corev1::ConfigMap, namespaced;
    Secret => corev1::Secret, namespaced;
    ServiceAccount => corev1::ServiceAccount, namespaced;
    Endpoints => corev1::Endpoints, namespaced;
    PersistentVolumeClaim => corev1::PersistentVolumeClaim, namespaced;
    CoreEvent => corev1::Event, namespaced;
    Namespace => corev1::Namespace, cluster;
    Node => corev1::Node, cluster;
    PersistentVolume => corev1::PersistentVolume, cluster;
    // apps/v1
    Deployment => appsv1::Deployment, namespaced;
    StatefulSet => appsv1::StatefulSet, namespaced;
    DaemonSet => appsv1::DaemonSet, namespaced;
    ReplicaSet => appsv1::ReplicaSet, namespaced;
    // batch/v1
    Job => batchv1::Job, namespaced;
    CronJob => batchv1::CronJob, namespaced;
    // networking.k8s.io/v1
    Ingress => networkingv1::Ingress, namespaced;
    NetworkPolicy => networkingv1::NetworkPolicy, namespaced;
    IngressClass => networkingv1::IngressClass, cluster;
    // rbac.authorization.k8s.io/v1
    Role => rbacv1::Role, namespaced;
    RoleBinding => rbacv1::RoleBinding, namespaced;
    ClusterRole => rbacv1::ClusterRole, cluster;
    ClusterRoleBinding => rbacv1::ClusterRoleBinding, cluster;
    // storage.k8s.io/v1
    StorageClass => storagev1::StorageClass, cluster;
    // events.k8s.io/v1
    Event => eventsv1::Event, namespaced;
    // apiextensions.k8s.io/v1
    CustomResourceDefinition => apiextensionsv1::CustomResourceDefinition, cluster;
}
