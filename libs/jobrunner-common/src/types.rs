use serde::{Deserialize, Serialize};

/// The slice of an ee2 job record the runner needs to launch the app
/// container. ee2 sends more fields; everything else is ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobParams {
    /// Qualified method name, `Module.method`.
    pub method: String,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub service_ver: Option<String>,
    /// Explicit container image, when ee2 has already resolved one.
    #[serde(default)]
    pub image: Option<String>,
    /// Narrative-supplied method parameters, passed through untouched.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl JobParams {
    /// Image for the app container: the explicit image if ee2 supplied one,
    /// otherwise derived from the method's module name and service version.
    pub fn container_image(&self) -> String {
        if let Some(ref image) = self.image {
            return image.clone();
        }
        let module = self.method.split('.').next().unwrap_or(&self.method);
        let tag = self.service_ver.as_deref().unwrap_or("latest");
        format!("kbase/{}:{}", module.to_lowercase(), tag)
    }
}
