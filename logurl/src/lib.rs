//! Builds per-container log-locator URLs by interpolating a template with
//! variables drawn from static configuration and CEL expressions evaluated
//! against the resource.
//!
//! Configuration is a directory of files, one variable per file, loaded once
//! at startup and never reloaded. A value whose text starts with `cel:` is
//! compiled; everything else is a literal.

use std::collections::HashMap;
use std::path::Path;

use kubearchive_cel::CompiledExpression;
use kubearchive_types::KubeResource;

const CEL_PREFIX: &str = "cel:";
const VAR_LOG_URL: &str = "LOG_URL";
const VAR_LOG_URL_JSONPATH: &str = "LOG_URL_JSONPATH";
const VAR_CONTAINER_NAME: &str = "CONTAINER_NAME";

/// The fixed-point interpolation always overrides whatever `CONTAINER_NAME`
/// file says, fanning out over the Pod's containers uniformly.
const CONTAINER_NAME_EXPR: &str = "obj.spec.containers.map(m, m.name)";

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("log-url configuration directory is missing required key {VAR_LOG_URL}")]
    MissingLogUrl,
    #[error("failed to read log-url configuration directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to compile CEL expression for variable {name}: {source}")]
    Compile {
        name: String,
        #[source]
        source: kubearchive_cel::CompileError,
    },
}

#[derive(Clone)]
enum Variable {
    Literal(String),
    Expr(CompiledExpression),
}

impl Variable {
    fn parse(name: &str, raw: &str) -> Result<Self, BuildError> {
        if let Some(source) = raw.strip_prefix(CEL_PREFIX) {
            let expr = CompiledExpression::compile(source).map_err(|source| BuildError::Compile {
                name: name.to_string(),
                source,
            })?;
            Ok(Variable::Expr(expr))
        } else {
            Ok(Variable::Literal(raw.to_string()))
        }
    }

    /// Evaluates to one or more values. An empty list collapses to a single
    /// empty string rather than disappearing from the cross-product.
    fn eval(&self, obj: &serde_json::Value) -> Vec<String> {
        match self {
            Variable::Literal(s) => vec![s.clone()],
            Variable::Expr(expr) => {
                let values = expr.eval_string_list(obj);
                if values.is_empty() {
                    vec![String::new()]
                } else {
                    values
                }
            }
        }
    }
}

/// Loaded, compiled log-URL configuration. Construction fails only on
/// missing `LOG_URL` or a CEL compile error; once built it cannot fail.
pub struct LogUrlBuilder {
    template: String,
    json_path: String,
    container_name: Variable,
    variables: Vec<(String, Variable)>,
}

impl LogUrlBuilder {
    /// Loads one variable per file in `dir`. File names are variable names;
    /// file contents (trimmed of a single trailing newline) are the raw
    /// value.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, BuildError> {
        let dir = dir.as_ref();
        let mut raw_vars: HashMap<String, String> = HashMap::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let content = std::fs::read_to_string(entry.path())?;
            raw_vars.insert(name, content.trim_end_matches('\n').to_string());
        }
        Self::from_map(raw_vars)
    }

    /// Same as [`Self::from_dir`] but from an in-memory map, for tests and
    /// for callers that already have the variables materialized.
    pub fn from_map(mut raw_vars: HashMap<String, String>) -> Result<Self, BuildError> {
        let template = raw_vars.remove(VAR_LOG_URL).ok_or(BuildError::MissingLogUrl)?;
        let json_path = raw_vars.remove(VAR_LOG_URL_JSONPATH).unwrap_or_default();
        raw_vars.remove(VAR_CONTAINER_NAME);

        let container_name = Variable::Expr(
            CompiledExpression::compile(CONTAINER_NAME_EXPR).map_err(|source| BuildError::Compile {
                name: VAR_CONTAINER_NAME.to_string(),
                source,
            })?,
        );

        let mut variables = Vec::with_capacity(raw_vars.len());
        for (name, raw) in raw_vars {
            let var = Variable::parse(&name, &raw)?;
            variables.push((name, var));
        }

        Ok(LogUrlBuilder {
            template,
            json_path,
            container_name,
            variables,
        })
    }

    pub fn json_path(&self) -> &str {
        &self.json_path
    }

    /// Produces the `(container_name, url)` tuples for `obj`, cross-product
    /// over every list-valued variable. Empty if `obj` has no containers and
    /// no other variable expands the map set beyond one entry.
    pub fn build(&self, obj: &KubeResource) -> Vec<(String, String)> {
        let mut maps: Vec<HashMap<&str, String>> = vec![HashMap::new()];

        let mut all_vars: Vec<(&str, &Variable)> =
            self.variables.iter().map(|(n, v)| (n.as_str(), v)).collect();
        all_vars.push((VAR_CONTAINER_NAME, &self.container_name));

        for (name, var) in all_vars {
            let values = var.eval(&obj.raw);
            let mut next = Vec::with_capacity(maps.len() * values.len().max(1));
            for m in &maps {
                for v in &values {
                    let mut m2 = m.clone();
                    m2.insert(name, v.clone());
                    next.push(m2);
                }
            }
            maps = next;
        }

        maps.into_iter()
            .map(|m| {
                let container_name = m.get(VAR_CONTAINER_NAME).cloned().unwrap_or_default();
                let url = interpolate(&self.template, &m);
                (container_name, url)
            })
            .collect()
    }
}

/// Replaces `{NAME}` occurrences repeatedly until a fixed point, so that a
/// variable's own value may itself reference `{OTHER}`. Bounded to guard
/// against a configuration cycle looping forever.
fn interpolate(template: &str, vars: &HashMap<&str, String>) -> String {
    let mut current = template.to_string();
    for _ in 0..16 {
        let next = replace_once(&current, vars);
        if next == current {
            return next;
        }
        current = next;
    }
    current
}

fn replace_once(s: &str, vars: &HashMap<&str, String>) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    loop {
        let Some(start) = rest.find('{') else {
            out.push_str(rest);
            break;
        };
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            break;
        };
        let name = &after[..end];
        match vars.get(name) {
            Some(val) => out.push_str(val),
            None => {
                out.push('{');
                out.push_str(name);
                out.push('}');
            }
        }
        rest = &after[end + 1..];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod_with_containers(names: &[&str]) -> KubeResource {
        let containers: Vec<_> = names.iter().map(|n| serde_json::json!({"name": n})).collect();
        KubeResource::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "a", "namespace": "default", "uid": "pod-uid-1"},
            "spec": {"containers": containers},
        }))
        .unwrap()
    }

    #[test]
    fn missing_log_url_fails_construction() {
        let vars = HashMap::new();
        assert!(matches!(
            LogUrlBuilder::from_map(vars),
            Err(BuildError::MissingLogUrl)
        ));
    }

    #[test]
    fn fans_out_over_three_containers() {
        let mut vars = HashMap::new();
        vars.insert(
            VAR_LOG_URL.to_string(),
            "https://logs/{POD_UID}/{CONTAINER_NAME}".to_string(),
        );
        vars.insert("POD_UID".to_string(), "cel:obj.metadata.uid".to_string());
        let builder = LogUrlBuilder::from_map(vars).unwrap();

        let pod = pod_with_containers(&["a", "b", "c"]);
        let mut tuples = builder.build(&pod);
        tuples.sort();

        let names: Vec<_> = tuples.iter().map(|(n, _)| n.clone()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        for (name, url) in &tuples {
            assert!(url.contains("pod-uid-1"));
            assert!(url.contains(name.as_str()));
        }
    }

    #[test]
    fn nested_variable_reference_resolves_to_fixed_point() {
        let mut vars = HashMap::new();
        vars.insert(VAR_LOG_URL.to_string(), "{BASE}/logs/{POD_UID}".to_string());
        vars.insert("BASE".to_string(), "https://example.test".to_string());
        vars.insert("POD_UID".to_string(), "cel:obj.metadata.uid".to_string());
        let builder = LogUrlBuilder::from_map(vars).unwrap();

        let pod = pod_with_containers(&["only"]);
        let tuples = builder.build(&pod);
        assert_eq!(tuples.len(), 1);
        assert_eq!(tuples[0].1, "https://example.test/logs/pod-uid-1");
    }

    #[test]
    fn json_path_returned_verbatim() {
        let mut vars = HashMap::new();
        vars.insert(VAR_LOG_URL.to_string(), "https://logs/{CONTAINER_NAME}".to_string());
        vars.insert(VAR_LOG_URL_JSONPATH.to_string(), "$.log.lines".to_string());
        let builder = LogUrlBuilder::from_map(vars).unwrap();
        assert_eq!(builder.json_path(), "$.log.lines");
    }

    #[test]
    fn container_name_file_is_always_overridden() {
        let mut vars = HashMap::new();
        vars.insert(VAR_LOG_URL.to_string(), "https://logs/{CONTAINER_NAME}".to_string());
        vars.insert(VAR_CONTAINER_NAME.to_string(), "ignored-literal".to_string());
        let builder = LogUrlBuilder::from_map(vars).unwrap();

        let pod = pod_with_containers(&["real"]);
        let tuples = builder.build(&pod);
        assert_eq!(tuples, vec![("real".to_string(), "https://logs/real".to_string())]);
    }
}
