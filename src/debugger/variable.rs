//! Variable references and their rendering into DAP variable records.
//!
//! A reference is one of four kinds: a frame scope, a selector path rooted
//! in a scope (live composite values, writable through `setVariable`), a
//! value snapshot (results of `evaluate`), or a cached list of records
//! supplied by the external backend. References start at 1000, strictly
//! increase and are never reused within a session.

use std::collections::HashMap;

use serde_json::{json, Value as Json};

use crate::debugger::error::Error;
use crate::debugger::frame::FrameRegistry;
use crate::runtime::{Namespace, Value};

pub const FIRST_VAR_REF: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Locals,
    Globals,
}

/// One step of a selector path into a composite value.
#[derive(Debug, Clone, PartialEq)]
pub enum PathSeg {
    /// List index.
    Index(usize),
    /// Map key or object field.
    Key(String),
}

#[derive(Debug, Clone)]
pub enum VarRef {
    /// All variables of one frame scope.
    Scope { frame_id: i64, kind: ScopeKind },
    /// A composite value reachable from a scope root; re-resolved against
    /// the live frame on every request.
    Path { frame_id: i64, kind: ScopeKind, root: String, path: Vec<PathSeg> },
    /// A detached value snapshot (evaluate results).
    Snapshot(Value),
    /// Pre-materialised variable records from the external backend.
    Cached(Vec<Json>),
}

#[derive(Default)]
pub struct VariableStore {
    next_ref: i64,
    refs: HashMap<i64, VarRef>,
}

impl VariableStore {
    pub fn new() -> Self {
        VariableStore { next_ref: FIRST_VAR_REF, refs: HashMap::new() }
    }

    pub fn alloc(&mut self, var_ref: VarRef) -> i64 {
        let key = self.next_ref;
        self.next_ref += 1;
        self.refs.insert(key, var_ref);
        key
    }

    pub fn get(&self, key: i64) -> Result<&VarRef, Error> {
        self.refs.get(&key).ok_or(Error::VariableRefNotFound(key))
    }

    /// Drop the stored references but keep the counter monotonic.
    pub fn clear(&mut self) {
        self.refs.clear();
    }

    /// Materialise the children of a reference as DAP variable records.
    pub fn variables(
        &mut self,
        key: i64,
        registry: &FrameRegistry,
        filter: Option<&str>,
        start: usize,
        count: usize,
    ) -> Result<Vec<Json>, Error> {
        let var_ref = self.get(key)?.clone();
        let mut out = match var_ref {
            VarRef::Scope { frame_id, kind } => {
                let namespace = scope_namespace(registry, frame_id, kind)?;
                namespace
                    .iter()
                    .map(|(name, value)| {
                        let reference = if value.is_composite() {
                            self.alloc(VarRef::Path {
                                frame_id,
                                kind,
                                root: name.clone(),
                                path: Vec::new(),
                            })
                        } else {
                            0
                        };
                        render_variable(name, value, reference)
                    })
                    .collect()
            }
            VarRef::Path { frame_id, kind, root, path } => {
                let namespace = scope_namespace(registry, frame_id, kind)?;
                let value = resolve_path(&namespace, &root, &path)?;
                self.composite_children(&value, |store, seg, child| {
                    if child.is_composite() {
                        let mut child_path = path.clone();
                        child_path.push(seg);
                        store.alloc(VarRef::Path {
                            frame_id,
                            kind,
                            root: root.clone(),
                            path: child_path,
                        })
                    } else {
                        0
                    }
                })
            }
            VarRef::Snapshot(value) => self.composite_children(&value, |store, _seg, child| {
                if child.is_composite() {
                    store.alloc(VarRef::Snapshot(child.clone()))
                } else {
                    0
                }
            }),
            VarRef::Cached(records) => records,
        };

        if let Some(filter) = filter {
            out.retain(|record| {
                let is_indexed = record
                    .get("name")
                    .and_then(Json::as_str)
                    .map(|name| name.parse::<usize>().is_ok())
                    .unwrap_or(false);
                match filter {
                    "indexed" => is_indexed,
                    "named" => !is_indexed,
                    _ => true,
                }
            });
        }
        if start > 0 {
            out = out.into_iter().skip(start).collect();
        }
        if count > 0 {
            out.truncate(count);
        }
        Ok(out)
    }

    fn composite_children(
        &mut self,
        value: &Value,
        mut make_ref: impl FnMut(&mut Self, PathSeg, &Value) -> i64,
    ) -> Vec<Json> {
        let mut out = Vec::new();
        match value {
            Value::List(items) => {
                for (idx, item) in items.iter().enumerate() {
                    let reference = make_ref(self, PathSeg::Index(idx), item);
                    out.push(render_variable(&idx.to_string(), item, reference));
                }
            }
            Value::Map(items) => {
                for (name, item) in items {
                    let reference = make_ref(self, PathSeg::Key(name.clone()), item);
                    out.push(render_variable(name, item, reference));
                }
            }
            Value::Object { fields, .. } => {
                for (name, item) in fields {
                    let reference = make_ref(self, PathSeg::Key(name.clone()), item);
                    out.push(render_variable(name, item, reference));
                }
            }
            _ => {}
        }
        out
    }

    /// Assign `value` to the member `name` of the target behind `key` and
    /// return the resulting variable record.
    pub fn set_variable(
        &mut self,
        key: i64,
        registry: &FrameRegistry,
        name: &str,
        value: Value,
    ) -> Result<Json, Error> {
        let var_ref = self.get(key)?.clone();
        match var_ref {
            VarRef::Scope { frame_id, kind } => {
                let record = registry.get(frame_id)?;
                match kind {
                    ScopeKind::Locals => {
                        let mut data = record.handle.lock().unwrap();
                        if !data.live {
                            return Err(Error::FrameNotFound(frame_id));
                        }
                        data.locals.insert(name.to_string(), value.clone());
                    }
                    ScopeKind::Globals => {
                        let globals = record.handle.lock().unwrap().globals.clone();
                        globals
                            .lock()
                            .unwrap()
                            .insert(name.to_string(), value.clone());
                    }
                }
                let reference = if value.is_composite() {
                    self.alloc(VarRef::Path {
                        frame_id,
                        kind,
                        root: name.to_string(),
                        path: Vec::new(),
                    })
                } else {
                    0
                };
                Ok(render_variable(name, &value, reference))
            }
            VarRef::Path { frame_id, kind, root, path } => {
                let record = registry.get(frame_id)?;
                let seg = member_segment(name);
                match kind {
                    ScopeKind::Locals => {
                        let mut data = record.handle.lock().unwrap();
                        if !data.live {
                            return Err(Error::FrameNotFound(frame_id));
                        }
                        assign_path(&mut data.locals, &root, &path, &seg, value.clone())?;
                    }
                    ScopeKind::Globals => {
                        let globals = record.handle.lock().unwrap().globals.clone();
                        let mut globals = globals.lock().unwrap();
                        assign_path(&mut globals, &root, &path, &seg, value.clone())?;
                    }
                }
                let reference = if value.is_composite() {
                    let mut child_path = path;
                    child_path.push(seg);
                    self.alloc(VarRef::Path { frame_id, kind, root, path: child_path })
                } else {
                    0
                };
                Ok(render_variable(name, &value, reference))
            }
            VarRef::Snapshot(_) | VarRef::Cached(_) => {
                Err(Error::BadAssignTarget(format!("variable reference {key}")))
            }
        }
    }

    /// Reference for an `evaluate` result; 0 for scalars.
    pub fn snapshot_ref(&mut self, value: &Value) -> i64 {
        if value.is_composite() {
            self.alloc(VarRef::Snapshot(value.clone()))
        } else {
            0
        }
    }
}

fn member_segment(name: &str) -> PathSeg {
    match name.parse::<usize>() {
        Ok(idx) => PathSeg::Index(idx),
        Err(_) => PathSeg::Key(name.to_string()),
    }
}

fn scope_namespace(
    registry: &FrameRegistry,
    frame_id: i64,
    kind: ScopeKind,
) -> Result<Namespace, Error> {
    let record = registry.get(frame_id)?;
    let data = record.handle.lock().unwrap();
    if !data.live {
        return Err(Error::FrameNotFound(frame_id));
    }
    Ok(match kind {
        ScopeKind::Locals => data.locals.clone(),
        ScopeKind::Globals => data.globals.lock().unwrap().clone(),
    })
}

fn resolve_path(namespace: &Namespace, root: &str, path: &[PathSeg]) -> Result<Value, Error> {
    let mut current = namespace
        .get(root)
        .cloned()
        .ok_or_else(|| Error::Eval(format!("name `{root}` is not defined")))?;
    for seg in path {
        current = step(&current, seg)?;
    }
    Ok(current)
}

fn step(value: &Value, seg: &PathSeg) -> Result<Value, Error> {
    match (value, seg) {
        (Value::List(items), PathSeg::Index(idx)) => items
            .get(*idx)
            .cloned()
            .ok_or_else(|| Error::Eval(format!("index {idx} out of range"))),
        (Value::Map(items), PathSeg::Key(key)) => items
            .get(key)
            .cloned()
            .ok_or_else(|| Error::Eval(format!("key `{key}` not found"))),
        (Value::Object { fields, .. }, PathSeg::Key(key)) => fields
            .get(key)
            .cloned()
            .ok_or_else(|| Error::Eval(format!("object has no field `{key}`"))),
        (other, _) => Err(Error::Eval(format!(
            "{} is not a composite value",
            other.type_name()
        ))),
    }
}

fn assign_path(
    namespace: &mut Namespace,
    root: &str,
    path: &[PathSeg],
    last: &PathSeg,
    value: Value,
) -> Result<(), Error> {
    let target = namespace
        .get_mut(root)
        .ok_or_else(|| Error::Eval(format!("name `{root}` is not defined")))?;
    let mut current = target;
    for seg in path {
        current = step_mut(current, seg)?;
    }
    match (current, last) {
        (Value::List(items), PathSeg::Index(idx)) => {
            if *idx >= items.len() {
                return Err(Error::Eval(format!("index {idx} out of range")));
            }
            items[*idx] = value;
        }
        (Value::Map(items), PathSeg::Key(key)) => {
            items.insert(key.clone(), value);
        }
        (Value::Object { fields, .. }, PathSeg::Key(key)) => {
            fields.insert(key.clone(), value);
        }
        (other, _) => return Err(Error::BadAssignTarget(other.type_name().to_string())),
    }
    Ok(())
}

fn step_mut<'a>(value: &'a mut Value, seg: &PathSeg) -> Result<&'a mut Value, Error> {
    match (value, seg) {
        (Value::List(items), PathSeg::Index(idx)) => items
            .get_mut(*idx)
            .ok_or_else(|| Error::Eval(format!("index {idx} out of range"))),
        (Value::Map(items), PathSeg::Key(key)) => items
            .get_mut(key)
            .ok_or_else(|| Error::Eval(format!("key `{key}` not found"))),
        (Value::Object { fields, .. }, PathSeg::Key(key)) => fields
            .get_mut(key)
            .ok_or_else(|| Error::Eval(format!("object has no field `{key}`"))),
        (other, _) => Err(Error::Eval(format!(
            "{} is not a composite value",
            other.type_name()
        ))),
    }
}

/// Render one value as a DAP variable record.
pub fn render_variable(name: &str, value: &Value, reference: i64) -> Json {
    let mut record = json!({
        "name": name,
        "value": value.repr(),
        "type": value.type_name(),
        "variablesReference": reference,
    });
    if value.named_children() > 0 {
        record["namedVariables"] = json!(value.named_children());
    }
    if value.indexed_children() > 0 {
        record["indexedVariables"] = json!(value.indexed_children());
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debugger::frame::new_frame;
    use indexmap::IndexMap;
    use std::sync::{Arc, Mutex};

    fn registry_with_frame() -> (FrameRegistry, i64) {
        let globals = Arc::new(Mutex::new(Namespace::new()));
        globals
            .lock()
            .unwrap()
            .insert("limit".to_string(), Value::Int(100));
        let frame = new_frame("main", "/tmp/p.scr", globals);
        {
            let mut data = frame.lock().unwrap();
            data.locals.insert("x".to_string(), Value::Int(10));
            data.locals.insert(
                "items".to_string(),
                Value::List(vec![Value::Int(1), Value::Int(2)]),
            );
            let mut fields = IndexMap::new();
            fields.insert("size".to_string(), Value::Int(7));
            data.locals.insert(
                "obj".to_string(),
                Value::Object { class: "Box".into(), fields },
            );
        }
        let mut registry = FrameRegistry::new();
        let id = registry.mint(1, frame).id;
        (registry, id)
    }

    #[test]
    fn test_refs_start_at_1000_and_increase() {
        let mut store = VariableStore::new();
        let a = store.alloc(VarRef::Snapshot(Value::Int(1)));
        let b = store.alloc(VarRef::Snapshot(Value::Int(2)));
        assert_eq!(a, 1000);
        assert_eq!(b, 1001);
        store.clear();
        let c = store.alloc(VarRef::Snapshot(Value::Int(3)));
        assert_eq!(c, 1002);
    }

    #[test]
    fn test_scope_listing() {
        let (registry, frame_id) = registry_with_frame();
        let mut store = VariableStore::new();
        let scope = store.alloc(VarRef::Scope { frame_id, kind: ScopeKind::Locals });
        let variables = store.variables(scope, &registry, None, 0, 0).unwrap();
        let names: Vec<&str> = variables
            .iter()
            .map(|v| v["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["x", "items", "obj"]);
        let items = variables.iter().find(|v| v["name"] == "items").unwrap();
        assert!(items["variablesReference"].as_i64().unwrap() >= FIRST_VAR_REF);
        assert_eq!(items["indexedVariables"], json!(2));
    }

    #[test]
    fn test_path_listing_and_assignment() {
        let (registry, frame_id) = registry_with_frame();
        let mut store = VariableStore::new();
        let scope = store.alloc(VarRef::Scope { frame_id, kind: ScopeKind::Locals });
        let variables = store.variables(scope, &registry, None, 0, 0).unwrap();
        let items_ref = variables.iter().find(|v| v["name"] == "items").unwrap()
            ["variablesReference"]
            .as_i64()
            .unwrap();

        let children = store.variables(items_ref, &registry, None, 0, 0).unwrap();
        assert_eq!(children[0]["value"], "1");

        let record = store
            .set_variable(items_ref, &registry, "0", Value::Int(42))
            .unwrap();
        assert_eq!(record["value"], "42");
        let children = store.variables(items_ref, &registry, None, 0, 0).unwrap();
        assert_eq!(children[0]["value"], "42");
    }

    #[test]
    fn test_invalid_reference_is_an_error() {
        let (registry, _frame_id) = registry_with_frame();
        let mut store = VariableStore::new();
        let err = store.variables(4242, &registry, None, 0, 0).unwrap_err();
        assert!(matches!(err, Error::VariableRefNotFound(4242)));
    }

    #[test]
    fn test_stale_frame_is_an_error_not_a_crash() {
        let (mut registry, frame_id) = registry_with_frame();
        let mut store = VariableStore::new();
        let scope = store.alloc(VarRef::Scope { frame_id, kind: ScopeKind::Locals });
        registry.invalidate();
        let err = store.variables(scope, &registry, None, 0, 0).unwrap_err();
        assert!(matches!(err, Error::FrameNotFound(_)));
    }

    #[test]
    fn test_globals_scope_assignment() {
        let (registry, frame_id) = registry_with_frame();
        let mut store = VariableStore::new();
        let scope = store.alloc(VarRef::Scope { frame_id, kind: ScopeKind::Globals });
        store
            .set_variable(scope, &registry, "limit", Value::Int(1))
            .unwrap();
        let variables = store.variables(scope, &registry, None, 0, 0).unwrap();
        assert_eq!(variables[0]["name"], "limit");
        assert_eq!(variables[0]["value"], "1");
    }

    #[test]
    fn test_paging() {
        let (registry, frame_id) = registry_with_frame();
        let mut store = VariableStore::new();
        let scope = store.alloc(VarRef::Scope { frame_id, kind: ScopeKind::Locals });
        let page = store.variables(scope, &registry, None, 1, 1).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0]["name"], "items");
    }

    #[test]
    fn test_snapshot_children() {
        let (registry, _frame_id) = registry_with_frame();
        let mut store = VariableStore::new();
        let value = Value::List(vec![Value::Int(5), Value::List(vec![Value::Int(6)])]);
        let key = store.snapshot_ref(&value);
        let children = store.variables(key, &registry, None, 0, 0).unwrap();
        assert_eq!(children.len(), 2);
        assert!(children[1]["variablesReference"].as_i64().unwrap() > 0);
        let err = store
            .set_variable(key, &registry, "0", Value::Int(9))
            .unwrap_err();
        assert!(matches!(err, Error::BadAssignTarget(_)));
    }
}
