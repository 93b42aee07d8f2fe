/// Port the init/run API listens on inside the runtime image.
pub const CONTAINER_API_PORT: u16 = 8080;
/// Port the node inspector binds inside the runtime image.
pub const CONTAINER_DEBUG_PORT: u16 = 5858;

/// Everything the engine needs to know about its environment: which host
/// ports to bind, what to call the managed container, where the runtimes
/// directory lives, and the fixed in-container paths used by debug sessions.
///
/// One instance is constructed up front and handed to [`crate::LocalEngine`];
/// there is no ambient global configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Fixed name for the managed container. Unique per host; a stale
    /// container holding this name makes creation fail.
    pub container_name: String,
    /// Host port mapped to the container's init/run API.
    pub api_port: u16,
    /// Host port mapped to the container's debugger.
    pub debug_port: u16,
    /// Endpoint serving the runtimes listing (`{"runtimes": {...}}`).
    /// A bare host is allowed; `https://` is prepended when no scheme is given.
    pub runtimes_endpoint: String,
    /// Image used when the runtimes directory has no entry for a kind.
    pub default_image: String,
    /// Kind every debuggable nodejs action is pinned to; the inspector
    /// protocol is only wired up for this runtime image.
    pub debug_kind: String,
    /// Entry function name passed to the init call.
    pub entry_point: String,
    /// In-container directory the staged debug files are copied to.
    pub action_dir: String,
    /// In-container path the debug harness writes the serialized result to.
    pub result_path: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            container_name: "localfn".to_string(),
            api_port: 8080,
            debug_port: 5858,
            runtimes_endpoint: "openwhisk.ng.bluemix.net".to_string(),
            default_image: "openwhisk/action-nodejs-v8".to_string(),
            debug_kind: "nodejs:8".to_string(),
            entry_point: "main".to_string(),
            action_dir: "/nodejsAction".to_string(),
            result_path: "/tmp/localfn-result.json".to_string(),
        }
    }
}
