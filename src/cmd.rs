use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DebugError, Result};

/// Key of the nested spark configuration inside the job configuration.
pub const CONF_KEY: &str = "conf";
pub const DRIVER_JAVA_OPTIONS_KEY: &str = "spark.driver.extraJavaOptions";
pub const MAX_APP_ATTEMPTS_KEY: &str = "spark.yarn.maxAppAttempts";

/// JDWP agent in server mode without an address, the JVM binds an ephemeral
/// port and announces it on stdout.
pub const DEBUG_AGENT_OPTION: &str = "-agentlib:jdwp=transport=dt_socket,server=y,suspend=n";

/// Any of these in the driver options means a debug agent is already configured
const DEBUG_AGENT_PREFIXES: [&str; 2] = ["-agentlib:jdwp", "-Xrunjdwp"];

/// Where the application artifact comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ArtifactRef {
    /// A jar on the submitting machine, uploaded before submission
    LocalPath(String),
    /// An artifact already present in cluster storage
    Uploaded(String),
}

/// A spark batch submission.
///
/// Built once through [`SubmissionParameterBuilder`] (or deserialized from a job
/// file) and never mutated afterwards. [`SubmissionParameter::to_debug_parameter`]
/// produces a new instance.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionParameter {
    /// The cluster the batch targets, client side only
    #[serde(default)]
    cluster_name: String,
    #[serde(default)]
    artifact: Option<ArtifactRef>,
    /// The entry point file (jar or script) as seen by the cluster
    file: String,
    #[serde(default)]
    class_name: Option<String>,
    #[serde(default)]
    files: Vec<String>,
    #[serde(default)]
    jars: Vec<String>,
    #[serde(default)]
    args: Vec<String>,
    /// Everything else Livy accepts, `conf` holds the spark configuration
    #[serde(default)]
    job_config: BTreeMap<String, Value>,
}

impl SubmissionParameter {
    pub fn builder() -> SubmissionParameterBuilder {
        SubmissionParameterBuilder::new()
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn artifact(&self) -> Option<&ArtifactRef> {
        self.artifact.as_ref()
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn class_name(&self) -> Option<&str> {
        self.class_name.as_deref()
    }

    pub fn files(&self) -> &[String] {
        &self.files
    }

    pub fn jars(&self) -> &[String] {
        &self.jars
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn job_config(&self) -> &BTreeMap<String, Value> {
        &self.job_config
    }

    /// Looks up a key of the nested spark `conf` mapping.
    pub fn conf(&self, key: &str) -> Option<&Value> {
        self.job_config
            .get(CONF_KEY)
            .and_then(Value::as_object)
            .and_then(|conf| conf.get(key))
    }

    /// Returns a copy with the JDWP agent appended to the driver java options
    /// and application attempts limited to one.
    ///
    /// Operator supplied driver options are kept. Applying this to an already
    /// debug-enabled parameter yields an equal parameter, while any other JDWP
    /// agent already present is rejected.
    pub fn to_debug_parameter(&self) -> Result<SubmissionParameter> {
        let mut debug = self.clone();

        let conf = debug
            .job_config
            .entry(CONF_KEY.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if conf.is_null() {
            *conf = Value::Object(Map::new());
        }
        let conf = match conf {
            Value::Object(conf) => conf,
            other => {
                return Err(DebugError::Configuration(format!(
                    "`{}` must be a mapping, got {}",
                    CONF_KEY, other
                )))
            }
        };

        let options = match conf.get(DRIVER_JAVA_OPTIONS_KEY) {
            None | Some(Value::Null) => DEBUG_AGENT_OPTION.to_string(),
            Some(Value::String(existing)) => append_debug_agent(existing)?,
            Some(other) => {
                return Err(DebugError::Configuration(format!(
                    "`{}` must be a string, got {}",
                    DRIVER_JAVA_OPTIONS_KEY, other
                )))
            }
        };

        conf.insert(DRIVER_JAVA_OPTIONS_KEY.to_string(), Value::String(options));
        conf.insert(MAX_APP_ATTEMPTS_KEY.to_string(), Value::String("1".to_string()));

        Ok(debug)
    }

    /// Renders the Livy `POST /batches` body.
    ///
    /// The job configuration is flattened into the top level, the named fields
    /// win over job configuration entries with the same key.
    pub fn to_batch_request(&self) -> Value {
        let mut body: Map<String, Value> = self
            .job_config
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        body.insert("file".to_string(), Value::String(self.file.clone()));
        if let Some(class_name) = &self.class_name {
            body.insert("className".to_string(), Value::String(class_name.clone()));
        }
        for (key, list) in [("files", &self.files), ("jars", &self.jars), ("args", &self.args)] {
            if !list.is_empty() {
                body.insert(key.to_string(), Value::from(list.clone()));
            }
        }

        Value::Object(body)
    }
}

fn append_debug_agent(existing: &str) -> Result<String> {
    if existing.matches('"').count() % 2 != 0 || existing.matches('\'').count() % 2 != 0 {
        return Err(DebugError::Configuration(format!(
            "unbalanced quotes in `{}`: {}",
            DRIVER_JAVA_OPTIONS_KEY, existing
        )));
    }

    let mut already_enabled = false;
    for option in existing.split_whitespace() {
        if option == DEBUG_AGENT_OPTION {
            already_enabled = true;
        } else if DEBUG_AGENT_PREFIXES.iter().any(|p| option.starts_with(p)) {
            return Err(DebugError::Configuration(format!(
                "a debug agent is already configured in `{}`: {}",
                DRIVER_JAVA_OPTIONS_KEY, option
            )));
        }
    }

    if already_enabled {
        Ok(existing.to_string())
    } else if existing.trim().is_empty() {
        Ok(DEBUG_AGENT_OPTION.to_string())
    } else if existing.ends_with(char::is_whitespace) {
        Ok(format!("{}{}", existing, DEBUG_AGENT_OPTION))
    } else {
        Ok(format!("{} {}", existing, DEBUG_AGENT_OPTION))
    }
}

#[derive(Debug, Default)]
pub struct SubmissionParameterBuilder {
    /// The cluster the batch targets
    cluster_name: Option<String>,
    /// The application artifact
    artifact: Option<ArtifactRef>,
    /// The entry point file
    file: Option<String>,
    /// The main class of a jar application
    class_name: Option<String>,
    /// Files shipped to the working directory of each executor
    files: Vec<String>,
    /// Jars put on the driver and executor classpaths
    jars: Vec<String>,
    /// The program arguments
    args: Vec<String>,
    /// Livy job configuration, including the nested spark `conf`
    job_config: BTreeMap<String, Value>,
}

impl SubmissionParameterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cluster_name(mut self, cluster_name: String) -> Self {
        self.cluster_name = Some(cluster_name);
        self
    }

    pub fn artifact(mut self, artifact: ArtifactRef) -> Self {
        self.artifact = Some(artifact);
        self
    }

    pub fn file(mut self, file: String) -> Self {
        self.file = Some(file);
        self
    }

    pub fn class_name(mut self, class_name: String) -> Self {
        self.class_name = Some(class_name);
        self
    }

    pub fn files(mut self, files: Vec<String>) -> Self {
        self.files = files;
        self
    }

    pub fn jars(mut self, jars: Vec<String>) -> Self {
        self.jars = jars;
        self
    }

    pub fn args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Sets a top level Livy job option such as `driverMemory`
    pub fn job_config(mut self, key: &str, value: Value) -> Self {
        self.job_config.insert(key.to_string(), value);
        self
    }

    /// Sets one entry of the nested spark `conf` mapping
    pub fn conf(mut self, key: &str, value: &str) -> Self {
        let conf = self
            .job_config
            .entry(CONF_KEY.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !conf.is_object() {
            *conf = Value::Object(Map::new());
        }
        if let Value::Object(conf) = conf {
            conf.insert(key.to_string(), Value::String(value.to_string()));
        }
        self
    }

    pub fn build(self) -> SubmissionParameter {
        SubmissionParameter {
            cluster_name: self.cluster_name.unwrap_or_default(),
            artifact: self.artifact,
            file: self.file.unwrap_or_default(),
            class_name: self.class_name,
            files: self.files,
            jars: self.jars,
            args: self.args,
            job_config: self.job_config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> SubmissionParameter {
        SubmissionParameter::builder()
            .cluster_name("spark-prod".to_string())
            .artifact(ArtifactRef::Uploaded("wordcount.jar".to_string()))
            .file("wasbs:///jars/wordcount.jar".to_string())
            .class_name("com.example.WordCount".to_string())
            .args(vec!["input.txt".to_string()])
            .build()
    }

    fn driver_options(param: &SubmissionParameter) -> &str {
        param
            .conf(DRIVER_JAVA_OPTIONS_KEY)
            .and_then(Value::as_str)
            .unwrap()
    }

    #[test]
    fn debug_parameter_adds_agent_and_single_attempt() {
        let debug = base().to_debug_parameter().unwrap();
        assert_eq!(driver_options(&debug), DEBUG_AGENT_OPTION);
        assert_eq!(debug.conf(MAX_APP_ATTEMPTS_KEY), Some(&json!("1")));
        assert_eq!(debug.file(), "wasbs:///jars/wordcount.jar");
        assert_eq!(debug.class_name(), Some("com.example.WordCount"));
    }

    #[test]
    fn debug_parameter_keeps_existing_driver_options() {
        let param = SubmissionParameter::builder()
            .file("app.jar".to_string())
            .conf(DRIVER_JAVA_OPTIONS_KEY, "-Dlog4j.configuration=custom.properties -Xss4m")
            .conf(MAX_APP_ATTEMPTS_KEY, "4")
            .build();
        let debug = param.to_debug_parameter().unwrap();
        let options = driver_options(&debug);
        assert!(options.contains("-Dlog4j.configuration=custom.properties -Xss4m"));
        assert!(options.ends_with(DEBUG_AGENT_OPTION));
        assert_eq!(debug.conf(MAX_APP_ATTEMPTS_KEY), Some(&json!("1")));
    }

    #[test]
    fn debug_parameter_does_not_touch_the_original() {
        let param = base();
        let _ = param.to_debug_parameter().unwrap();
        assert_eq!(param.conf(DRIVER_JAVA_OPTIONS_KEY), None);
        assert_eq!(param, base());
    }

    #[test]
    fn debug_parameter_is_idempotent() {
        let once = base().to_debug_parameter().unwrap();
        let twice = once.to_debug_parameter().unwrap();
        assert_eq!(once, twice);
        assert_eq!(twice.conf(MAX_APP_ATTEMPTS_KEY), Some(&json!("1")));
        assert_eq!(driver_options(&twice).matches("-agentlib:jdwp").count(), 1);
    }

    #[test]
    fn debug_parameter_rejects_conflicting_agent() {
        for existing in [
            "-agentlib:jdwp=transport=dt_socket,server=y,suspend=y,address=5005",
            "-Xdebug -Xrunjdwp:transport=dt_socket,server=y",
            "-Dfoo=\"unterminated",
        ] {
            let param = SubmissionParameter::builder()
                .file("app.jar".to_string())
                .conf(DRIVER_JAVA_OPTIONS_KEY, existing)
                .build();
            assert!(matches!(
                param.to_debug_parameter(),
                Err(DebugError::Configuration(_))
            ));
        }
    }

    #[test]
    fn debug_parameter_rejects_non_mapping_conf() {
        let param = SubmissionParameter::builder()
            .file("app.jar".to_string())
            .job_config(CONF_KEY, json!(["not", "a", "map"]))
            .build();
        assert!(matches!(
            param.to_debug_parameter(),
            Err(DebugError::Configuration(_))
        ));
    }

    #[test]
    fn batch_request_flattens_job_config() {
        let param = SubmissionParameter::builder()
            .cluster_name("spark-prod".to_string())
            .artifact(ArtifactRef::LocalPath("/tmp/app.jar".to_string()))
            .file("wasbs:///app.jar".to_string())
            .class_name("com.example.Main".to_string())
            .jars(vec!["wasbs:///dep.jar".to_string()])
            .job_config("driverMemory", json!("2g"))
            .conf("spark.executor.cores", "2")
            .build();

        assert_eq!(
            param.to_batch_request(),
            json!({
                "file": "wasbs:///app.jar",
                "className": "com.example.Main",
                "jars": ["wasbs:///dep.jar"],
                "driverMemory": "2g",
                "conf": { "spark.executor.cores": "2" },
            })
        );
    }

    #[test]
    fn deserializes_job_file() {
        let param: SubmissionParameter = serde_json::from_value(json!({
            "clusterName": "spark-dev",
            "artifact": { "localPath": "target/app.jar" },
            "file": "wasbs:///app.jar",
            "className": "com.example.Main",
            "args": ["--verbose"],
            "jobConfig": { "conf": { "spark.driver.extraJavaOptions": "-Xss4m" } },
        }))
        .unwrap();

        assert_eq!(param.cluster_name(), "spark-dev");
        assert_eq!(
            param.artifact(),
            Some(&ArtifactRef::LocalPath("target/app.jar".to_string()))
        );
        assert_eq!(param.conf(DRIVER_JAVA_OPTIONS_KEY), Some(&json!("-Xss4m")));
    }
}
