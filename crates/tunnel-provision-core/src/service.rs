use serde_json::{Value, json};

pub const SERVICE_NAME: &str = "ha-tunnel";
pub const TUNNEL_IMAGE: &str = "ghcr.io/bramalkema/gcp-ha-tunnel/tunnel-server:latest";

/// Shape of the Cloud Run service that hosts the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    pub container_port: u16,
    pub cpu: String,
    pub memory: String,
    pub concurrency: u32,
    pub timeout_seconds: u32,
    pub min_scale: u32,
    pub max_scale: u32,
}

impl Default for ServiceSpec {
    fn default() -> Self {
        Self {
            name: SERVICE_NAME.to_string(),
            image: TUNNEL_IMAGE.to_string(),
            container_port: 8080,
            cpu: "1".to_string(),
            memory: "256Mi".to_string(),
            concurrency: 80,
            timeout_seconds: 3600,
            min_scale: 0,
            max_scale: 1,
        }
    }
}

impl ServiceSpec {
    /// Knative `serving.knative.dev/v1` Service with the relay credentials
    /// injected as `AUTH=<user>:<password>`.
    pub fn descriptor(&self, auth_user: &str, password: &str) -> Value {
        json!({
            "apiVersion": "serving.knative.dev/v1",
            "kind": "Service",
            "metadata": {
                "name": self.name,
                "annotations": {
                    "run.googleapis.com/ingress": "all"
                }
            },
            "spec": {
                "template": {
                    "metadata": {
                        "annotations": {
                            "autoscaling.knative.dev/minScale": self.min_scale.to_string(),
                            "autoscaling.knative.dev/maxScale": self.max_scale.to_string(),
                            "run.googleapis.com/cpu-throttling": "true"
                        }
                    },
                    "spec": {
                        "containerConcurrency": self.concurrency,
                        "timeoutSeconds": self.timeout_seconds,
                        "containers": [{
                            "image": self.image,
                            "env": [
                                { "name": "AUTH", "value": format!("{auth_user}:{password}") }
                            ],
                            "resources": {
                                "limits": {
                                    "cpu": self.cpu,
                                    "memory": self.memory
                                }
                            },
                            "ports": [{ "containerPort": self.container_port }]
                        }]
                    }
                }
            }
        })
    }
}
