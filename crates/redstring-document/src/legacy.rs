// legacy.rs — Readers for the two older document shapes.
//
// Older writers stored containers as JSON objects keyed by id (sometimes
// without repeating the id inside the value), and used `nodePrototypes`
// where the current shape has `prototypeSpace.prototypes`:
//
//   legacy-nested:  { "legacy": { "nodePrototypes": {..}, "graphs": {..}, "edges": {..} } }
//   oldest-flat:    { "nodePrototypes": {..}, "graphs": {..}, "edges": {..} }
//
// Both shapes are read-only; writers always emit the current shape.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::DocumentError;
use crate::graph::{Collection, Edge, Graph, GraphSnapshot, Keyed, Node};

/// Build a snapshot from the object that holds `nodePrototypes` / `graphs` /
/// `edges` (the `legacy` sub-object, or the document root for oldest-flat).
pub fn snapshot_from_container(container: &Map<String, Value>) -> Result<GraphSnapshot, DocumentError> {
    let nodes: Collection<Node> = collect(container.get("nodePrototypes"), |_| {})?;
    let graphs: Collection<Graph> = collect(container.get("graphs"), normalize_graph)?;
    let edges: Collection<Edge> = collect(container.get("edges"), normalize_edge)?;

    let active_graph_id = container
        .get("activeGraphId")
        .and_then(Value::as_str)
        .map(str::to_string);
    let open_graph_ids = container
        .get("openGraphIds")
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(GraphSnapshot {
        graphs,
        nodes,
        edges,
        active_graph_id,
        open_graph_ids,
    })
}

/// Flatten an array-or-keyed-object into a list of entry objects, filling in
/// `id` from the map key when the value does not carry one.
fn entries(value: Option<&Value>) -> Vec<Value> {
    match value {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(key, entry)| {
                let mut entry = entry.clone();
                if let Value::Object(obj) = &mut entry {
                    obj.entry("id").or_insert_with(|| Value::String(key.clone()));
                }
                entry
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn collect<T, F>(value: Option<&Value>, normalize: F) -> Result<Collection<T>, DocumentError>
where
    T: DeserializeOwned + Keyed,
    F: Fn(&mut Map<String, Value>),
{
    let mut out = Collection::new();
    for mut entry in entries(value) {
        if let Value::Object(obj) = &mut entry {
            normalize(obj);
        }
        out.insert(serde_json::from_value::<T>(entry)?);
    }
    Ok(out)
}

/// Old graphs keyed their instances by id too.
fn normalize_graph(obj: &mut Map<String, Value>) {
    if obj.get("instances").is_some_and(Value::is_object) {
        let list = entries(obj.get("instances"));
        obj.insert("instances".to_string(), Value::Array(list));
    }
}

/// The oldest writer used `sourceId` / `targetId`.
fn normalize_edge(obj: &mut Map<String, Value>) {
    if !obj.contains_key("destinationId") {
        if let Some(target) = obj.remove("targetId") {
            obj.insert("destinationId".to_string(), target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keyed_objects_fill_missing_ids() {
        let container = json!({
            "nodePrototypes": {
                "n1": {"name": "One"},
                "n2": {"id": "n2", "name": "Two"}
            }
        });
        let snapshot = snapshot_from_container(container.as_object().unwrap()).unwrap();
        assert_eq!(snapshot.nodes.len(), 2);
        assert_eq!(snapshot.nodes.get("n1").unwrap().name, "One");
    }

    #[test]
    fn target_id_is_accepted_for_edges() {
        let container = json!({
            "edges": [{"id": "e1", "sourceId": "a", "targetId": "b"}]
        });
        let snapshot = snapshot_from_container(container.as_object().unwrap()).unwrap();
        assert_eq!(snapshot.edges.get("e1").unwrap().destination_id, "b");
    }

    #[test]
    fn keyed_instances_become_a_collection() {
        let container = json!({
            "graphs": {
                "g1": {
                    "name": "Main",
                    "instances": {
                        "i1": {"prototypeId": "n1", "x": 10.0, "y": 5.0},
                        "i2": {"prototypeId": "n1"}
                    }
                }
            }
        });
        let snapshot = snapshot_from_container(container.as_object().unwrap()).unwrap();
        let graph = snapshot.graphs.get("g1").unwrap();
        assert_eq!(graph.instances.len(), 2);
        assert_eq!(graph.instances.get("i1").unwrap().x, 10.0);
    }

    #[test]
    fn missing_containers_yield_empty_snapshot() {
        let container = json!({"graphs": null});
        let snapshot = snapshot_from_container(container.as_object().unwrap()).unwrap();
        assert!(snapshot.is_empty());
    }
}
