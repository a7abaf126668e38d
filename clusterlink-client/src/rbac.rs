/// A Kubernetes resource kind the lifecycle probes `list` access for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KubeApiResource {
    pub kind: &'static str,
    /// Plural resource name used in authorization checks.
    pub api_name: &'static str,
    /// API group, empty for core.
    pub group: &'static str,
}

const fn res(kind: &'static str, api_name: &'static str, group: &'static str) -> KubeApiResource {
    KubeApiResource {
        kind,
        api_name,
        group,
    }
}

pub const API_RESOURCES: &[KubeApiResource] = &[
    res("ClusterRole", "clusterroles", "rbac.authorization.k8s.io"),
    res("ClusterRoleBinding", "clusterrolebindings", "rbac.authorization.k8s.io"),
    res("ConfigMap", "configmaps", ""),
    res("CronJob", "cronjobs", "batch"),
    res("CustomResourceDefinition", "customresourcedefinitions", "apiextensions.k8s.io"),
    res("DaemonSet", "daemonsets", "apps"),
    res("Deployment", "deployments", "apps"),
    res("Endpoints", "endpoints", ""),
    res("Event", "events", ""),
    res("HorizontalPodAutoscaler", "horizontalpodautoscalers", "autoscaling"),
    res("Ingress", "ingresses", "networking.k8s.io"),
    res("Job", "jobs", "batch"),
    res("Namespace", "namespaces", ""),
    res("LimitRange", "limitranges", ""),
    res("NetworkPolicy", "networkpolicies", "networking.k8s.io"),
    res("Node", "nodes", ""),
    res("PersistentVolume", "persistentvolumes", ""),
    res("PersistentVolumeClaim", "persistentvolumeclaims", ""),
    res("Pod", "pods", ""),
    res("PodDisruptionBudget", "poddisruptionbudgets", "policy"),
    res("ResourceQuota", "resourcequotas", ""),
    res("ReplicaSet", "replicasets", "apps"),
    res("Role", "roles", "rbac.authorization.k8s.io"),
    res("RoleBinding", "rolebindings", "rbac.authorization.k8s.io"),
    res("Secret", "secrets", ""),
    res("ServiceAccount", "serviceaccounts", ""),
    res("Service", "services", ""),
    res("StatefulSet", "statefulsets", "apps"),
    res("StorageClass", "storageclasses", "storage.k8s.io"),
];

pub fn by_api_name(api_name: &str) -> Option<&'static KubeApiResource> {
    API_RESOURCES.iter().find(|r| r.api_name == api_name)
}

pub fn by_kind(kind: &str) -> Option<&'static KubeApiResource> {
    API_RESOURCES.iter().find(|r| r.kind == kind)
}
