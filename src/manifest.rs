use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::ops::Deref;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const REVISION_LABEL: &str = "revision";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest directory {}: {source}", dir.display())]
    ReadDir { dir: PathBuf, source: io::Error },
    #[error("failed to read manifest {}: {source}", path.display())]
    ReadFile { path: PathBuf, source: io::Error },
    #[error("failed to decode manifest {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("manifest {} has no 'revision' label", path.display())]
    MissingRevision { path: PathBuf },
    #[error("manifest {} has non-numeric revision label '{value}'", path.display())]
    InvalidRevision { path: PathBuf, value: String },
    #[error("manifest {} has no container named '{container}'", path.display())]
    MissingContainer { path: PathBuf, container: String },
    #[error("container '{container}' in manifest {} declares no container port", path.display())]
    MissingPort { path: PathBuf, container: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaticPodManifest {
    pub filename: PathBuf,
    pub revision: u64,
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct StaticPodManifests(Vec<StaticPodManifest>);

impl StaticPodManifests {
    pub fn new(mut manifests: Vec<StaticPodManifest>) -> Self {
        manifests.sort_by(|a, b| {
            a.revision
                .cmp(&b.revision)
                .then_with(|| a.filename.cmp(&b.filename))
        });
        Self(manifests)
    }

    pub fn active_manifest(&self) -> Option<&StaticPodManifest> {
        self.0.first()
    }
}

impl Deref for StaticPodManifests {
    type Target = [StaticPodManifest];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Deserialize)]
struct PodDocument {
    #[serde(default)]
    metadata: PodMetadata,
    #[serde(default)]
    spec: PodSpec,
}

#[derive(Debug, Default, Deserialize)]
struct PodMetadata {
    #[serde(default)]
    labels: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct PodSpec {
    #[serde(default)]
    containers: Vec<ContainerSpec>,
}

#[derive(Debug, Deserialize)]
struct ContainerSpec {
    name: String,
    #[serde(default)]
    ports: Vec<ContainerPort>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerPort {
    container_port: u16,
}

/// A matching file that cannot be decoded, or that lacks a numeric revision
/// or a port for `container_name`, fails the whole scan: skipping it would
/// silently change which instance is considered active.
pub fn read_static_pod_manifests(
    dir: impl AsRef<Path>,
    prefix: &str,
    container_name: &str,
) -> Result<StaticPodManifests, ManifestError> {
    let dir = dir.as_ref();
    let read_dir_err = |source| ManifestError::ReadDir {
        dir: dir.to_path_buf(),
        source,
    };

    let mut manifests = Vec::new();
    for entry in fs::read_dir(dir).map_err(read_dir_err)? {
        let entry = entry.map_err(read_dir_err)?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if !file_name.starts_with(prefix) {
            continue;
        }
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        manifests.push(read_static_pod_manifest(&path, container_name)?);
    }

    Ok(StaticPodManifests::new(manifests))
}

pub fn read_static_pod_manifest(
    path: &Path,
    container_name: &str,
) -> Result<StaticPodManifest, ManifestError> {
    let raw = fs::read_to_string(path).map_err(|source| ManifestError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    let pod: PodDocument = serde_yaml::from_str(&raw).map_err(|source| ManifestError::Decode {
        path: path.to_path_buf(),
        source,
    })?;

    let revision = parse_revision(path, pod.metadata.labels.get(REVISION_LABEL))?;

    let container = pod
        .spec
        .containers
        .iter()
        .find(|container| container.name == container_name)
        .ok_or_else(|| ManifestError::MissingContainer {
            path: path.to_path_buf(),
            container: container_name.to_string(),
        })?;
    let port = container
        .ports
        .first()
        .map(|port| port.container_port)
        .ok_or_else(|| ManifestError::MissingPort {
            path: path.to_path_buf(),
            container: container_name.to_string(),
        })?;

    Ok(StaticPodManifest {
        filename: path.to_path_buf(),
        revision,
        port,
    })
}

fn parse_revision(path: &Path, label: Option<&serde_yaml::Value>) -> Result<u64, ManifestError> {
    let invalid = |value: String| ManifestError::InvalidRevision {
        path: path.to_path_buf(),
        value,
    };
    match label {
        None | Some(serde_yaml::Value::Null) => Err(ManifestError::MissingRevision {
            path: path.to_path_buf(),
        }),
        Some(serde_yaml::Value::String(value)) => value
            .trim()
            .parse::<u64>()
            .map_err(|_| invalid(value.clone())),
        Some(serde_yaml::Value::Number(number)) => {
            number.as_u64().ok_or_else(|| invalid(number.to_string()))
        }
        Some(other) => Err(invalid(format!("{other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use super::{read_static_pod_manifests, ManifestError};

    fn write_pod(dir: &Path, file: &str, revision: &str, port: u16) {
        fs::write(
            dir.join(file),
            format!(
                "apiVersion: v1\nkind: Pod\nmetadata:\n  name: kube-apiserver\n  labels:\n    app: openshift-kube-apiserver\n    revision: \"{revision}\"\nspec:\n  containers:\n  - name: kube-apiserver-insecure-readyz\n    ports:\n    - containerPort: 6080\n  - name: kube-apiserver\n    ports:\n    - containerPort: {port}\n"
            ),
        )
        .expect("write pod");
    }

    #[test]
    fn scan_orders_matching_manifests_by_revision() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_pod(temp.path(), "kube-apiserver-pod-12.yaml", "12", 6444);
        write_pod(temp.path(), "kube-apiserver-pod-9.yaml", "9", 6443);
        write_pod(temp.path(), "etcd-pod.yaml", "4", 2379);
        fs::create_dir(temp.path().join("kube-apiserver-pod-dir")).expect("mkdir");

        let manifests =
            read_static_pod_manifests(temp.path(), "kube-apiserver-pod-", "kube-apiserver")
                .expect("scan");

        let summary = manifests
            .iter()
            .map(|m| (m.revision, m.port))
            .collect::<Vec<_>>();
        assert_eq!(summary, vec![(9, 6443), (12, 6444)]);
        let active = manifests.active_manifest().expect("active manifest");
        assert_eq!(active.revision, 9);
        assert!(active.filename.ends_with("kube-apiserver-pod-9.yaml"));
    }

    #[test]
    fn empty_directory_has_no_active_manifest() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manifests =
            read_static_pod_manifests(temp.path(), "kube-apiserver-pod-", "kube-apiserver")
                .expect("scan");
        assert!(manifests.is_empty());
        assert!(manifests.active_manifest().is_none());
    }

    #[test]
    fn non_numeric_revision_fails_scan() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_pod(temp.path(), "kube-apiserver-pod-3.yaml", "3", 6443);
        write_pod(temp.path(), "kube-apiserver-pod-x.yaml", "latest", 6444);

        let err = read_static_pod_manifests(temp.path(), "kube-apiserver-pod-", "kube-apiserver")
            .expect_err("scan should fail");
        assert!(matches!(err, ManifestError::InvalidRevision { ref value, .. } if value == "latest"));
    }

    #[test]
    fn missing_revision_label_fails_scan() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(
            temp.path().join("kube-apiserver-pod-1.yaml"),
            "metadata:\n  labels: {}\nspec:\n  containers:\n  - name: kube-apiserver\n    ports:\n    - containerPort: 6443\n",
        )
        .expect("write pod");

        let err = read_static_pod_manifests(temp.path(), "kube-apiserver-pod-", "kube-apiserver")
            .expect_err("scan should fail");
        assert!(matches!(err, ManifestError::MissingRevision { .. }));
    }

    #[test]
    fn json_manifest_with_numeric_revision_is_accepted() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(
            temp.path().join("kube-apiserver-pod-5.json"),
            r#"{"metadata":{"labels":{"revision":5}},"spec":{"containers":[{"name":"kube-apiserver","ports":[{"containerPort":6445}]}]}}"#,
        )
        .expect("write pod");

        let manifests =
            read_static_pod_manifests(temp.path(), "kube-apiserver-pod-", "kube-apiserver")
                .expect("scan");
        assert_eq!(manifests.len(), 1);
        assert_eq!(manifests[0].revision, 5);
        assert_eq!(manifests[0].port, 6445);
    }

    #[test]
    fn missing_container_fails_scan() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_pod(temp.path(), "kube-apiserver-pod-3.yaml", "3", 6443);

        let err = read_static_pod_manifests(temp.path(), "kube-apiserver-pod-", "openshift-apiserver")
            .expect_err("scan should fail");
        assert!(matches!(err, ManifestError::MissingContainer { .. }));
    }

    #[test]
    fn unreadable_directory_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = read_static_pod_manifests(
            temp.path().join("missing"),
            "kube-apiserver-pod-",
            "kube-apiserver",
        )
        .expect_err("scan should fail");
        assert!(matches!(err, ManifestError::ReadDir { .. }));
    }
}
