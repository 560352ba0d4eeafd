//! Staging messages and the task built from them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use cellgrid_core::StagerConfig;
use cellgrid_state::{
    Action, CachedDependency, EnvVar, ResourceLimits, Resources, Task, TaskState,
};

use crate::error::{StagerError, StagerResult};

pub const STAGING_DOMAIN: &str = "staging";

const APP_DIR: &str = "/app";
const BUILDPACKS_DIR: &str = "/tmp/buildpacks";
const COMPILER_DIR: &str = "/tmp/compiler";
const CACHE_DIR: &str = "/tmp/cache";
const OUTPUT_CACHE: &str = "/tmp/output-cache";
const DROPLET: &str = "/tmp/droplet";
pub const RESULT_FILE: &str = "/tmp/result.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Buildpack {
    pub name: String,
    pub key: String,
    pub url: String,
}

/// Body of a `<topic>.start` message.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StagingRequest {
    pub app_id: String,
    pub task_id: String,
    pub stack: String,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub file_descriptors: u64,
    pub app_bits_download_uri: String,
    pub buildpacks: Vec<Buildpack>,
    pub environment: Vec<EnvVar>,
    pub build_artifacts_cache_download_uri: Option<String>,
    pub build_artifacts_cache_upload_uri: Option<String>,
}

impl StagingRequest {
    pub fn task_guid(&self) -> String {
        format!("staging-{}-{}", self.app_id, self.task_id)
    }
}

/// Stored in the task annotation so the reply can be addressed without
/// the start message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StagingAnnotation {
    pub app_id: String,
    pub task_id: String,
}

/// Body of a `<topic>.finished` message. On success the compiler's result
/// object (`buildpack_key`, `detected_start_command`, ...) is inlined.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StagingResponse {
    pub app_id: String,
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub result: Map<String, Value>,
}

impl StagingResponse {
    pub fn failed(app_id: &str, task_id: &str, error: impl Into<String>) -> Self {
        Self {
            app_id: app_id.to_string(),
            task_id: task_id.to_string(),
            error: Some(error.into()),
            result: Map::new(),
        }
    }

    /// Build the reply for a completed staging task.
    pub fn from_task(task: &Task) -> StagerResult<Self> {
        let annotation: StagingAnnotation = serde_json::from_str(&task.annotation)?;
        if task.failed {
            return Ok(Self::failed(
                &annotation.app_id,
                &annotation.task_id,
                task.failure_reason.clone(),
            ));
        }
        let mut result = match serde_json::from_str::<Value>(&task.result) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                return Err(StagerError::Result(format!("expected an object, got {other}")));
            }
            Err(e) => return Err(StagerError::Result(e.to_string())),
        };
        result.remove("app_id");
        result.remove("task_id");
        result.remove("error");
        Ok(Self {
            app_id: annotation.app_id,
            task_id: annotation.task_id,
            error: None,
            result,
        })
    }
}

/// The task that compiles `request` into a droplet with `compiler`.
pub fn staging_task(
    request: &StagingRequest,
    compiler: &str,
    config: &StagerConfig,
) -> StagerResult<Task> {
    let mut downloads = vec![download(&request.app_bits_download_uri, APP_DIR, None)];
    for buildpack in &request.buildpacks {
        downloads.push(download(
            &buildpack.url,
            &format!("{BUILDPACKS_DIR}/{}", buildpack.key),
            Some(buildpack.key.clone()),
        ));
    }
    if let Some(uri) = &request.build_artifacts_cache_download_uri {
        downloads.push(Action::Try {
            action: Box::new(download(uri, CACHE_DIR, None)),
        });
    }

    let order: Vec<&str> = request.buildpacks.iter().map(|b| b.key.as_str()).collect();
    let file_descriptors = if request.file_descriptors > 0 {
        request.file_descriptors
    } else {
        config.min_file_descriptors
    };
    let compile = Action::Run {
        path: format!("{COMPILER_DIR}/run"),
        args: vec![
            format!("-appDir={APP_DIR}"),
            format!("-buildpacksDir={BUILDPACKS_DIR}"),
            format!("-buildpackOrder={}", order.join(",")),
            format!("-buildArtifactsCacheDir={CACHE_DIR}"),
            format!("-outputDroplet={DROPLET}"),
            format!("-outputMetadata={RESULT_FILE}"),
            format!("-outputBuildArtifactsCache={OUTPUT_CACHE}"),
        ],
        env: request.environment.clone(),
        dir: None,
        user: String::new(),
        resource_limits: ResourceLimits {
            nofile: Some(file_descriptors),
        },
    };

    let mut actions = vec![
        Action::Parallel { actions: downloads },
        Action::EmitProgress {
            action: Box::new(compile),
            start_message: "Staging...".to_string(),
            success_message: "Staging complete".to_string(),
            // Replies carry the bare exit reason.
            failure_prefix: String::new(),
        },
    ];
    if !config.droplet_upload_base.is_empty() {
        actions.push(Action::Upload {
            from: DROPLET.to_string(),
            to: format!(
                "{}/{}",
                config.droplet_upload_base.trim_end_matches('/'),
                request.app_id
            ),
            user: String::new(),
        });
    }
    if let Some(uri) = &request.build_artifacts_cache_upload_uri {
        actions.push(Action::Try {
            action: Box::new(Action::Upload {
                from: OUTPUT_CACHE.to_string(),
                to: uri.clone(),
                user: String::new(),
            }),
        });
    }

    let annotation = serde_json::to_string(&StagingAnnotation {
        app_id: request.app_id.clone(),
        task_id: request.task_id.clone(),
    })?;

    Ok(Task {
        task_guid: request.task_guid(),
        domain: STAGING_DOMAIN.to_string(),
        rootfs: format!("preloaded:{}", request.stack),
        action: Action::Serial { actions },
        resources: Resources {
            memory_mb: request.memory_mb.max(config.min_memory_mb),
            disk_mb: request.disk_mb.max(config.min_disk_mb),
            max_pids: 0,
        },
        volume_mounts: vec![],
        egress_rules: vec![],
        privileged: false,
        result_file: Some(RESULT_FILE.to_string()),
        properties: BTreeMap::new(),
        cached_dependencies: vec![CachedDependency {
            name: "compiler".to_string(),
            from: compiler.to_string(),
            to: COMPILER_DIR.to_string(),
            cache_key: Some(format!("compiler-{}", request.stack)),
        }],
        annotation,
        state: TaskState::Pending,
        cell_id: String::new(),
        failed: false,
        failure_reason: String::new(),
        result: String::new(),
        created_at: 0,
        updated_at: 0,
        first_completed_at: None,
        modification_index: 0,
    })
}

fn download(from: &str, to: &str, cache_key: Option<String>) -> Action {
    Action::Download {
        from: from.to_string(),
        to: to.to_string(),
        cache_key,
        user: String::new(),
    }
}
