//! Desired runtime sub-resources of a Suggestion.
//!
//! Every function here is pure: the same Suggestion and configuration always
//! produce the same records. The reconciler only creates what is missing.

use hs_types::{
    Container, ContainerPort, Deployment, DeploymentSpec, EarlyStoppingConfig, ObjectMeta,
    PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeSpec,
    PodTemplate, PolicyRule, ResumePolicy, Role, RoleBinding, Service, ServiceAccount, ServicePort,
    ServiceSpec, Subject, Suggestion, SuggestionConfig, Volume, VolumeMount, DEFAULT_STORAGE_CLASS,
    LABEL_DEPLOYMENT_NAME, LABEL_EXPERIMENT_NAME, LABEL_SUGGESTION_NAME,
};
use std::collections::BTreeMap;

pub const SUGGESTION_CONTAINER_NAME: &str = "suggestion";
pub const EARLY_STOPPING_CONTAINER_NAME: &str = "early-stopping";
const SUGGESTION_PORT_NAME: &str = "suggestion-api";
const EARLY_STOPPING_PORT_NAME: &str = "earlystop-api";
const VOLUME_NAME: &str = "suggestion-volume";

/// Ports the algorithm services listen on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimePorts {
    pub suggestion: u16,
    pub early_stopping: u16,
}

/// Labels selecting the pods of a Suggestion's runtime.
pub fn runtime_labels(suggestion: &Suggestion) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_DEPLOYMENT_NAME.to_string(), suggestion.runtime_name());
    labels.insert(LABEL_SUGGESTION_NAME.to_string(), suggestion.meta.name.clone());
    if let Some(experiment) = suggestion.meta.labels.get(LABEL_EXPERIMENT_NAME) {
        labels.insert(LABEL_EXPERIMENT_NAME.to_string(), experiment.clone());
    }
    labels
}

fn owned_meta(suggestion: &Suggestion, namespace: &str, name: String) -> ObjectMeta {
    let mut meta = ObjectMeta::new(namespace, name);
    meta.labels = runtime_labels(suggestion);
    meta.owner = suggestion.meta.owner_reference("Suggestion");
    meta
}

fn namespaced(suggestion: &Suggestion, name: String) -> ObjectMeta {
    owned_meta(suggestion, &suggestion.meta.namespace, name)
}

pub fn desired_service(suggestion: &Suggestion, ports: RuntimePorts) -> Service {
    let mut service_ports = vec![ServicePort {
        name: SUGGESTION_PORT_NAME.to_string(),
        port: ports.suggestion,
        target_port: ports.suggestion,
    }];
    if suggestion.spec.early_stopping_algorithm().is_some() {
        service_ports.push(ServicePort {
            name: EARLY_STOPPING_PORT_NAME.to_string(),
            port: ports.early_stopping,
            target_port: ports.early_stopping,
        });
    }

    Service {
        meta: namespaced(suggestion, suggestion.runtime_name()),
        spec: ServiceSpec {
            selector: runtime_labels(suggestion),
            ports: service_ports,
        },
    }
}

pub fn desired_deployment(
    suggestion: &Suggestion,
    config: &SuggestionConfig,
    early_stopping: Option<&EarlyStoppingConfig>,
    ports: RuntimePorts,
) -> Deployment {
    let mut suggestion_container = Container {
        name: SUGGESTION_CONTAINER_NAME.to_string(),
        image: config.image.clone(),
        ports: vec![ContainerPort {
            name: SUGGESTION_PORT_NAME.to_string(),
            container_port: ports.suggestion,
        }],
        resources: config.resources.clone(),
        volume_mounts: Vec::new(),
    };

    let mut volumes = Vec::new();
    if suggestion.spec.resume_policy == ResumePolicy::FromVolume {
        suggestion_container.volume_mounts.push(VolumeMount {
            name: VOLUME_NAME.to_string(),
            mount_path: config.volume_mount_path.clone(),
        });
        volumes.push(Volume {
            name: VOLUME_NAME.to_string(),
            claim_name: suggestion.runtime_name(),
        });
    }

    let mut containers = vec![suggestion_container];
    let mut service_account_name = config.service_account_name.clone();
    if let Some(es) = early_stopping {
        containers.push(Container {
            name: EARLY_STOPPING_CONTAINER_NAME.to_string(),
            image: es.image.clone(),
            ports: vec![ContainerPort {
                name: EARLY_STOPPING_PORT_NAME.to_string(),
                container_port: ports.early_stopping,
            }],
            resources: es.resources.clone(),
            volume_mounts: Vec::new(),
        });
        // The early stopping service edits Trials, so it needs its own account.
        if service_account_name.is_none() {
            service_account_name = Some(suggestion.rbac_name());
        }
    }

    let labels = runtime_labels(suggestion);
    Deployment {
        meta: namespaced(suggestion, suggestion.runtime_name()),
        spec: DeploymentSpec {
            replicas: 1,
            selector: labels.clone(),
            template: PodTemplate {
                labels,
                containers,
                service_account_name,
                volumes,
            },
        },
        status: Default::default(),
    }
}

pub fn desired_volume_claim(suggestion: &Suggestion, config: &SuggestionConfig) -> PersistentVolumeClaim {
    let settings = &config.persistent_volume_claim;
    PersistentVolumeClaim {
        meta: namespaced(suggestion, suggestion.runtime_name()),
        spec: PersistentVolumeClaimSpec {
            storage_class_name: settings.storage_class_name.clone(),
            access_modes: settings.access_modes.clone(),
            storage: settings.storage.clone(),
        },
    }
}

/// Local volume backing the claim. Only claims on the default storage class
/// get one; any other class is provisioned elsewhere.
pub fn desired_volume(suggestion: &Suggestion, config: &SuggestionConfig) -> Option<PersistentVolume> {
    let claim = &config.persistent_volume_claim;
    if claim.storage_class_name != DEFAULT_STORAGE_CLASS {
        return None;
    }
    let name = suggestion.persistent_volume_name();
    Some(PersistentVolume {
        meta: owned_meta(suggestion, "", name.clone()),
        spec: PersistentVolumeSpec {
            storage_class_name: claim.storage_class_name.clone(),
            access_modes: claim.access_modes.clone(),
            capacity: claim.storage.clone(),
            host_path: format!("{}/{}", config.persistent_volume.host_path.trim_end_matches('/'), name),
        },
    })
}

/// Service account, role and binding letting the early stopping service
/// read and update Trials.
pub fn desired_rbac(suggestion: &Suggestion) -> (ServiceAccount, Role, RoleBinding) {
    let name = suggestion.rbac_name();
    let account = ServiceAccount {
        meta: namespaced(suggestion, name.clone()),
    };
    let role = Role {
        meta: namespaced(suggestion, name.clone()),
        rules: vec![PolicyRule {
            api_groups: vec!["hypersearch.io".to_string()],
            resources: vec!["trials".to_string(), "trials/status".to_string()],
            verbs: vec!["get".to_string(), "list".to_string(), "watch".to_string(), "patch".to_string()],
        }],
    };
    let binding = RoleBinding {
        meta: namespaced(suggestion, name.clone()),
        role_ref: name.clone(),
        subjects: vec![Subject {
            kind: "ServiceAccount".to_string(),
            name,
            namespace: suggestion.meta.namespace.clone(),
        }],
    };
    (account, role, binding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hs_types::{AlgorithmSpec, EarlyStoppingSpec, SuggestionSpec};
    use uuid::Uuid;

    const PORTS: RuntimePorts = RuntimePorts {
        suggestion: 6789,
        early_stopping: 6788,
    };

    fn suggestion(policy: ResumePolicy, early_stopping: bool) -> Suggestion {
        let mut meta = ObjectMeta::new("default", "mnist").with_label(LABEL_EXPERIMENT_NAME, "mnist");
        meta.uid = Some(Uuid::new_v4());
        Suggestion::new(
            meta,
            SuggestionSpec {
                algorithm: AlgorithmSpec::new("random"),
                early_stopping: early_stopping.then(|| EarlyStoppingSpec {
                    algorithm_name: "medianstop".to_string(),
                    algorithm_settings: Vec::new(),
                }),
                requests: 3,
                resume_policy: policy,
            },
        )
    }

    #[test]
    fn test_plain_runtime() {
        let s = suggestion(ResumePolicy::Never, false);
        let config = SuggestionConfig::with_image("hypersearch/suggestion-random:latest");

        let deployment = desired_deployment(&s, &config, None, PORTS);
        assert_eq!(deployment.meta.name, "mnist-random");
        assert_eq!(deployment.meta.owner.as_ref().unwrap().kind, "Suggestion");
        assert_eq!(deployment.spec.template.containers.len(), 1);
        assert!(deployment.spec.template.volumes.is_empty());
        assert!(deployment.spec.template.service_account_name.is_none());
        assert_eq!(deployment.spec.selector, deployment.spec.template.labels);

        let service = desired_service(&s, PORTS);
        assert_eq!(service.spec.ports.len(), 1);
        assert_eq!(service.spec.ports[0].port, 6789);

        // Pure: same input, same output.
        assert_eq!(desired_deployment(&s, &config, None, PORTS), deployment);
    }

    #[test]
    fn test_volume_and_early_stopping() {
        let s = suggestion(ResumePolicy::FromVolume, true);
        let config = SuggestionConfig::with_image("hypersearch/suggestion-random:latest");
        let es = EarlyStoppingConfig {
            image: "hypersearch/earlystopping-medianstop:latest".to_string(),
            ..Default::default()
        };

        let deployment = desired_deployment(&s, &config, Some(&es), PORTS);
        let template = &deployment.spec.template;
        assert_eq!(template.containers.len(), 2);
        assert_eq!(template.containers[0].volume_mounts[0].mount_path, "/opt/hypersearch/data");
        assert_eq!(template.volumes[0].claim_name, "mnist-random");
        assert_eq!(template.service_account_name.as_deref(), Some("mnist-random"));

        let claim = desired_volume_claim(&s, &config);
        assert_eq!(claim.spec.storage_class_name, DEFAULT_STORAGE_CLASS);
        let volume = desired_volume(&s, &config).unwrap();
        assert_eq!(volume.meta.name, "mnist-random-default");
        assert!(volume.spec.host_path.ends_with("/mnist-random-default"));

        let mut external = config.clone();
        external.persistent_volume_claim.storage_class_name = "ssd".to_string();
        assert!(desired_volume(&s, &external).is_none());

        let (account, role, binding) = desired_rbac(&s);
        assert_eq!(account.meta.name, "mnist-random");
        assert_eq!(binding.role_ref, role.meta.name);
        assert_eq!(desired_service(&s, PORTS).spec.ports.len(), 2);
    }
}
