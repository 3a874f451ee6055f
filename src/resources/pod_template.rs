//! Pod template generation for Elasticsearch nodes.
//!
//! Both node shapes (Deployment-backed and StatefulSet-backed) run the same
//! pod. The template carries two annotations used for change detection:
//! a hash of the rendered node configuration and a hash of the whole
//! template.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource, ExecAction,
    ObjectFieldSelector, PersistentVolumeClaimVolumeSource, PodSecurityContext, PodSpec,
    PodTemplateSpec, Probe, ResourceRequirements, SecretVolumeSource, SecurityContext, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use crate::crd::{
    Elasticsearch, ElasticsearchNode, HTTP_PORT, NodeRole, ResourceRequirementsSpec,
    TRANSPORT_PORT,
};
use crate::resources::common::{
    CONFIG_HASH_ANNOTATION, TEMPLATE_HASH_ANNOTATION, content_hash, discovery_service_name,
    node_labels, tls_secret_name,
};

/// Volume name of the data directory.
pub const DATA_VOLUME: &str = "elasticsearch-storage";
const CERTS_VOLUME: &str = "certificates";
const DATA_PATH: &str = "/usr/share/elasticsearch/data";
const CERTS_PATH: &str = "/usr/share/elasticsearch/config/secret";
/// Elasticsearch user ID in the official container image
const ELASTICSEARCH_USER_ID: i64 = 1000;
const TERMINATION_GRACE_PERIOD: i64 = 120;

/// How the Elasticsearch node name is derived inside the pod.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeNaming {
    /// Fixed to the workload name (single-replica nodes).
    Workload,
    /// Taken from the pod name (ordered sets).
    Pod,
}

/// Where the data directory lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DataVolume {
    /// Ephemeral storage.
    EmptyDir,
    /// A pre-provisioned claim with this name.
    Claim(String),
    /// Provided by the StatefulSet's volume claim template.
    ClaimTemplate,
}

/// A rendered pod template with its change-detection hashes.
#[derive(Clone, Debug)]
pub struct RenderedTemplate {
    pub template: PodTemplateSpec,
    pub template_hash: String,
    pub config_hash: String,
}

/// Render the Elasticsearch settings of a node as environment variables.
///
/// The official image turns `a.b.c=value` variables into settings.
pub fn render_node_config(
    resource: &Elasticsearch,
    node: &ElasticsearchNode,
    workload_name: &str,
    naming: NodeNaming,
) -> BTreeMap<String, String> {
    let mut config = BTreeMap::new();
    config.insert("cluster.name".to_string(), resource.name_any());
    let node_name = match naming {
        NodeNaming::Workload => workload_name.to_string(),
        NodeNaming::Pod => "$(POD_NAME)".to_string(),
    };
    config.insert("node.name".to_string(), node_name);
    config.insert(
        "node.master".to_string(),
        node.has_role(NodeRole::Master).to_string(),
    );
    config.insert(
        "node.data".to_string(),
        node.has_role(NodeRole::Data).to_string(),
    );
    config.insert(
        "node.ingest".to_string(),
        node.has_role(NodeRole::Client).to_string(),
    );
    config.insert("network.host".to_string(), "0.0.0.0".to_string());
    config.insert(
        "discovery.zen.ping.unicast.hosts".to_string(),
        discovery_service_name(resource),
    );
    config.insert("xpack.security.enabled".to_string(), "true".to_string());
    config.insert(
        "xpack.security.http.ssl.enabled".to_string(),
        (resource.spec.tls.scheme == "https").to_string(),
    );
    config.insert(
        "xpack.security.transport.ssl.enabled".to_string(),
        "true".to_string(),
    );
    config.insert(
        "xpack.ssl.certificate".to_string(),
        format!("{}/tls.crt", CERTS_PATH),
    );
    config.insert("xpack.ssl.key".to_string(), format!("{}/tls.key", CERTS_PATH));
    config.insert(
        "xpack.ssl.certificate_authorities".to_string(),
        format!("{}/ca.crt", CERTS_PATH),
    );
    config
}

/// JVM heap size for a memory limit: half the memory, in megabytes.
pub fn heap_size(memory: &str) -> String {
    let trimmed = memory.trim();
    let megabytes = if let Some(gi) = trimmed.strip_suffix("Gi") {
        gi.parse::<f64>().ok().map(|v| v * 1024.0)
    } else if let Some(mi) = trimmed.strip_suffix("Mi") {
        mi.parse::<f64>().ok()
    } else {
        None
    };

    match megabytes {
        Some(mb) if mb >= 2.0 => format!("{}m", (mb / 2.0) as u64),
        _ => "1g".to_string(),
    }
}

/// Build the pod template of a node.
pub fn build_pod_template(
    resource: &Elasticsearch,
    node: &ElasticsearchNode,
    workload_name: &str,
    naming: NodeNaming,
    data_volume: &DataVolume,
) -> Result<RenderedTemplate, serde_json::Error> {
    let config = render_node_config(resource, node, workload_name, naming);
    let config_hash = content_hash(&config)?;
    let resources = node
        .resources
        .clone()
        .unwrap_or_else(|| resource.spec.node_spec.resources.clone());

    let mut annotations = BTreeMap::new();
    annotations.insert(CONFIG_HASH_ANNOTATION.to_string(), config_hash.clone());

    let node_selector = if resource.spec.node_spec.node_selector.is_empty() {
        None
    } else {
        Some(resource.spec.node_spec.node_selector.clone())
    };

    let mut template = PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(node_labels(resource, workload_name, &node.roles)),
            annotations: Some(annotations),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            termination_grace_period_seconds: Some(TERMINATION_GRACE_PERIOD),
            security_context: Some(PodSecurityContext {
                fs_group: Some(ELASTICSEARCH_USER_ID),
                ..Default::default()
            }),
            containers: vec![generate_container(resource, &config, &resources)],
            volumes: Some(generate_volumes(resource, data_volume)),
            node_selector,
            ..Default::default()
        }),
    };

    // Hash is computed before the hash annotation is inserted
    let template_hash = content_hash(&template)?;
    if let Some(annotations) = template
        .metadata
        .as_mut()
        .and_then(|m| m.annotations.as_mut())
    {
        annotations.insert(TEMPLATE_HASH_ANNOTATION.to_string(), template_hash.clone());
    }

    Ok(RenderedTemplate {
        template,
        template_hash,
        config_hash,
    })
}

/// Read an annotation from a pod template.
pub fn template_annotation<'a>(template: &'a PodTemplateSpec, key: &str) -> Option<&'a str> {
    template
        .metadata
        .as_ref()
        .and_then(|m| m.annotations.as_ref())
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

fn generate_container(
    resource: &Elasticsearch,
    config: &BTreeMap<String, String>,
    resources: &ResourceRequirementsSpec,
) -> Container {
    let mut env = vec![EnvVar {
        name: "POD_NAME".to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: "metadata.name".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }];
    env.extend(config.iter().map(|(name, value)| EnvVar {
        name: name.clone(),
        value: Some(value.clone()),
        ..Default::default()
    }));
    let heap = heap_size(&resources.memory);
    env.push(EnvVar {
        name: "ES_JAVA_OPTS".to_string(),
        value: Some(format!("-Xms{} -Xmx{}", heap, heap)),
        ..Default::default()
    });

    Container {
        name: "elasticsearch".to_string(),
        image: Some(resource.spec.node_spec.image.clone()),
        ports: Some(vec![
            ContainerPort {
                container_port: HTTP_PORT,
                name: Some("restapi".to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
            ContainerPort {
                container_port: TRANSPORT_PORT,
                name: Some("cluster".to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
        ]),
        env: Some(env),
        resources: Some(generate_resource_requirements(resources)),
        volume_mounts: Some(vec![
            VolumeMount {
                name: DATA_VOLUME.to_string(),
                mount_path: DATA_PATH.to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: CERTS_VOLUME.to_string(),
                mount_path: CERTS_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ]),
        readiness_probe: Some(generate_readiness_probe(&resource.spec.tls.scheme)),
        security_context: Some(SecurityContext {
            allow_privilege_escalation: Some(false),
            run_as_user: Some(ELASTICSEARCH_USER_ID),
            capabilities: Some(Capabilities {
                drop: Some(vec!["ALL".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Memory is both request and limit; CPU is a request only.
fn generate_resource_requirements(resources: &ResourceRequirementsSpec) -> ResourceRequirements {
    let mut limits = BTreeMap::new();
    limits.insert("memory".to_string(), Quantity(resources.memory.clone()));

    let mut requests = BTreeMap::new();
    requests.insert("memory".to_string(), Quantity(resources.memory.clone()));
    requests.insert("cpu".to_string(), Quantity(resources.cpu.clone()));

    ResourceRequirements {
        limits: Some(limits),
        requests: Some(requests),
        ..Default::default()
    }
}

/// Ready once the local node answers its health endpoint.
fn generate_readiness_probe(scheme: &str) -> Probe {
    Probe {
        exec: Some(ExecAction {
            command: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                format!(
                    "curl -s -k --cert {certs}/tls.crt --key {certs}/tls.key \
                     {scheme}://localhost:{port}/_cluster/health?local=true",
                    certs = CERTS_PATH,
                    scheme = scheme,
                    port = HTTP_PORT
                ),
            ]),
        }),
        initial_delay_seconds: Some(10),
        period_seconds: Some(5),
        timeout_seconds: Some(30),
        failure_threshold: Some(3),
        ..Default::default()
    }
}

fn generate_volumes(resource: &Elasticsearch, data_volume: &DataVolume) -> Vec<Volume> {
    let mut volumes = vec![Volume {
        name: CERTS_VOLUME.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(tls_secret_name(resource)),
            default_mode: Some(0o400),
            ..Default::default()
        }),
        ..Default::default()
    }];

    match data_volume {
        DataVolume::EmptyDir => volumes.push(Volume {
            name: DATA_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        }),
        DataVolume::Claim(claim_name) => volumes.push(Volume {
            name: DATA_VOLUME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim_name.clone(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        DataVolume::ClaimTemplate => {}
    }

    volumes
}
