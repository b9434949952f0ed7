//! Replication filters.
//!
//! A [`FilterRequest`] names at most one filter kind. Compiling it yields a
//! [`FilterArtifact`]: the design document to install on every source db
//! (if the kind needs one) and the patch merged into each job document.
//!
//! | kind | design doc | job patch |
//! |------|------------|-----------|
//! | `js` | `_design/{prefix}_filterdoc` | `filter`, optional `query_params` |
//! | `mango` | none | `selector` |
//! | `doc_ids` | none | `doc_ids` |
//! | `view` | `_design/{prefix}_viewdoc` | `filter: "_view"`, `query_params.view` |

use crate::couch::Document;
use crate::error::{HarnessError, Result};
use crate::ids;
use serde_json::{json, Map, Value};

/// Pass-everything JavaScript filter.
pub const DEFAULT_JS_FILTER: &str = "function(doc, req) {return true;}";

/// Map function emitting every document id.
pub const DEFAULT_VIEW_MAP: &str = "function(doc) { emit(doc._id, null); };";

/// A filter argument: either a sensible default or an explicit value.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterArg<T> {
    Default,
    Custom(T),
}

impl<T> FilterArg<T> {
    fn or_else(self, default: impl FnOnce() -> T) -> T {
        match self {
            Self::Default => default(),
            Self::Custom(value) => value,
        }
    }
}

/// Which filter to apply to every job of a scenario.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterRequest {
    /// Server-side JavaScript filter function.
    pub js: Option<FilterArg<String>>,
    /// Mango selector object.
    pub mango: Option<FilterArg<Value>>,
    /// Explicit document ids. Defaults to the first generated document.
    pub doc_ids: Option<FilterArg<Vec<String>>>,
    /// Map function of a view used with the `_view` filter.
    pub view: Option<FilterArg<String>>,
    /// Extra parameters passed to a JavaScript filter.
    pub query_params: Option<Map<String, Value>>,
}

impl FilterRequest {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn js(body: FilterArg<String>) -> Self {
        Self {
            js: Some(body),
            ..Self::default()
        }
    }

    pub fn mango(selector: FilterArg<Value>) -> Self {
        Self {
            mango: Some(selector),
            ..Self::default()
        }
    }

    pub fn doc_ids(doc_ids: FilterArg<Vec<String>>) -> Self {
        Self {
            doc_ids: Some(doc_ids),
            ..Self::default()
        }
    }

    pub fn view(map: FilterArg<String>) -> Self {
        Self {
            view: Some(map),
            ..Self::default()
        }
    }

    pub fn with_query_params(mut self, params: Map<String, Value>) -> Self {
        self.query_params = Some(params);
        self
    }

    /// Names of the filter kinds that are set.
    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds = Vec::new();
        if self.js.is_some() {
            kinds.push("js");
        }
        if self.mango.is_some() {
            kinds.push("mango");
        }
        if self.doc_ids.is_some() {
            kinds.push("doc_ids");
        }
        if self.view.is_some() {
            kinds.push("view");
        }
        kinds
    }

    pub fn is_empty(&self) -> bool {
        self.kinds().is_empty()
    }
}

/// Compiled filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterArtifact {
    /// Design document to install on every source db.
    pub design_doc: Option<Document>,
    /// Fields merged into every job document.
    pub params: Map<String, Value>,
}

/// Compile `request` for `prefix`.
///
/// Fails with [`HarnessError::Config`] when more than one filter kind is
/// set or a selector is not a JSON object. Performs no I/O.
pub fn compile(prefix: &str, request: &FilterRequest) -> Result<FilterArtifact> {
    let kinds = request.kinds();
    if kinds.len() > 1 {
        return Err(HarnessError::Config(format!(
            "only one filter can be specified, got {}",
            kinds.join(", ")
        )));
    }

    let request = request.clone();
    if let Some(body) = request.js {
        return Ok(js_filter(prefix, body.or_else(|| DEFAULT_JS_FILTER.to_string()), request.query_params));
    }
    if let Some(selector) = request.mango {
        let selector = selector.or_else(|| json!({ "_id": { "$ne": null } }));
        if !selector.is_object() {
            return Err(HarnessError::Config(format!(
                "mango selector must be a JSON object, got {}",
                selector
            )));
        }
        let mut params = Map::new();
        params.insert("selector".into(), selector);
        return Ok(FilterArtifact {
            design_doc: None,
            params,
        });
    }
    if let Some(doc_ids) = request.doc_ids {
        let doc_ids = doc_ids.or_else(|| vec![ids::make_id(1, prefix)]);
        let mut params = Map::new();
        params.insert("doc_ids".into(), json!(doc_ids));
        return Ok(FilterArtifact {
            design_doc: None,
            params,
        });
    }
    if let Some(map) = request.view {
        return Ok(view_filter(prefix, map.or_else(|| DEFAULT_VIEW_MAP.to_string())));
    }
    Ok(FilterArtifact::default())
}

fn js_filter(prefix: &str, body: String, query_params: Option<Map<String, Value>>) -> FilterArtifact {
    let ddoc_name = format!("{}_filterdoc", prefix);
    let filter_name = format!("{}_filtername", prefix);
    let design_doc = json!({
        "_id": format!("_design/{}", ddoc_name),
        "filters": { filter_name.clone(): body },
    });

    let mut params = Map::new();
    params.insert("filter".into(), json!(format!("{}/{}", ddoc_name, filter_name)));
    if let Some(query_params) = query_params.filter(|q| !q.is_empty()) {
        params.insert("query_params".into(), Value::Object(query_params));
    }
    FilterArtifact {
        design_doc: as_document(design_doc),
        params,
    }
}

fn view_filter(prefix: &str, map: String) -> FilterArtifact {
    let ddoc_name = format!("{}_viewdoc", prefix);
    let view_name = format!("{}_viewname", prefix);
    let design_doc = json!({
        "_id": format!("_design/{}", ddoc_name),
        "views": { view_name.clone(): { "map": map } },
    });

    let mut params = Map::new();
    params.insert("filter".into(), json!("_view"));
    params.insert(
        "query_params".into(),
        json!({ "view": format!("{}/{}", ddoc_name, view_name) }),
    );
    FilterArtifact {
        design_doc: as_document(design_doc),
        params,
    }
}

fn as_document(value: Value) -> Option<Document> {
    match value {
        Value::Object(doc) => Some(doc),
        _ => None,
    }
}
