//! Diagram and cell types.
//!
//! Cells form an arena keyed by UUID; nodes and edges share one id
//! namespace. Edges reference endpoint cells by id and are validated at
//! mutation time, never by construction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Map;
use serde_json::Value;
use std::collections::HashSet;
use uuid::Uuid;

/// Diagram kinds. New kinds extend this tag set and the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DiagramKind {
    #[default]
    DataFlow,
    Architecture,
    Sequence,
}

/// 2D position and size for a node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Geometry {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// A waypoint on an edge path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// A single diagram cell: common envelope plus a per-kind payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub id: Uuid,
    #[serde(flatten)]
    pub body: CellBody,
}

/// Node or edge payload, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CellBody {
    Node {
        shape: String,
        geometry: Geometry,
        #[serde(default)]
        style: Option<String>,
        #[serde(default)]
        data: Map<String, Value>,
    },
    Edge {
        shape: String,
        source: Uuid,
        target: Uuid,
        #[serde(default)]
        waypoints: Vec<Point>,
        #[serde(default)]
        style: Option<String>,
        #[serde(default)]
        data: Map<String, Value>,
    },
}

impl Cell {
    pub fn node(id: Uuid, shape: impl Into<String>, geometry: Geometry) -> Self {
        Self {
            id,
            body: CellBody::Node {
                shape: shape.into(),
                geometry,
                style: None,
                data: Map::new(),
            },
        }
    }

    pub fn edge(id: Uuid, shape: impl Into<String>, source: Uuid, target: Uuid) -> Self {
        Self {
            id,
            body: CellBody::Edge {
                shape: shape.into(),
                source,
                target,
                waypoints: Vec::new(),
                style: None,
                data: Map::new(),
            },
        }
    }

    pub fn is_edge(&self) -> bool {
        matches!(self.body, CellBody::Edge { .. })
    }

    /// Endpoint ids for edges, empty for nodes.
    pub fn endpoints(&self) -> Vec<Uuid> {
        match &self.body {
            CellBody::Node { .. } => Vec::new(),
            CellBody::Edge { source, target, .. } => vec![*source, *target],
        }
    }
}

/// A diagram: an ordered cell arena with a monotone version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagram {
    pub id: Uuid,
    pub threat_model_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub kind: DiagramKind,
    #[serde(default)]
    pub cells: Vec<Cell>,
    /// Incremented on every accepted mutation. Never decreases.
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Diagram {
    pub fn new(threat_model_id: Uuid, name: impl Into<String>, kind: DiagramKind) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            threat_model_id,
            name: name.into(),
            kind,
            cells: Vec::new(),
            version: 0,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn cell(&self, id: Uuid) -> Option<&Cell> {
        self.cells.iter().find(|c| c.id == id)
    }

    pub fn cell_ids(&self) -> HashSet<Uuid> {
        self.cells.iter().map(|c| c.id).collect()
    }

    /// Validate that every edge references extant cells in this diagram.
    pub fn validate_references(&self) -> Result<(), Uuid> {
        let ids = self.cell_ids();
        for cell in &self.cells {
            for ep in cell.endpoints() {
                if !ids.contains(&ep) {
                    return Err(ep);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> Geometry {
        Geometry {
            x: 10.0,
            y: 20.0,
            width: 120.0,
            height: 60.0,
        }
    }

    #[test]
    fn edge_endpoints_must_exist() {
        let tm = Uuid::new_v4();
        let mut d = Diagram::new(tm, "DFD", DiagramKind::DataFlow);
        let n1 = Uuid::new_v4();
        let n2 = Uuid::new_v4();
        d.cells.push(Cell::node(n1, "process", geometry()));
        d.cells.push(Cell::node(n2, "store", geometry()));
        d.cells
            .push(Cell::edge(Uuid::new_v4(), "data_flow", n1, n2));
        assert!(d.validate_references().is_ok());

        let dangling = Uuid::new_v4();
        d.cells
            .push(Cell::edge(Uuid::new_v4(), "data_flow", n1, dangling));
        assert_eq!(d.validate_references(), Err(dangling));
    }

    #[test]
    fn cell_kind_tag_serializes_flat() {
        let cell = Cell::node(Uuid::new_v4(), "process", geometry());
        let json = serde_json::to_value(&cell).unwrap();
        assert_eq!(json["kind"], "node");
        assert_eq!(json["shape"], "process");
        assert!(json["geometry"]["width"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn edge_round_trips_through_json() {
        let e = Cell::edge(Uuid::new_v4(), "data_flow", Uuid::new_v4(), Uuid::new_v4());
        let json = serde_json::to_string(&e).unwrap();
        let back: Cell = serde_json::from_str(&json).unwrap();
        assert_eq!(e, back);
    }

    #[test]
    fn unknown_fields_are_ignored_on_ingress() {
        let id = Uuid::new_v4();
        let json = format!(
            r#"{{"id":"{id}","kind":"node","shape":"actor",
                 "geometry":{{"x":0,"y":0,"width":1,"height":1}},
                 "future_field":true}}"#
        );
        let cell: Cell = serde_json::from_str(&json).unwrap();
        assert_eq!(cell.id, id);
    }

    #[test]
    fn new_diagram_starts_at_version_zero() {
        let d = Diagram::new(Uuid::new_v4(), "DFD", DiagramKind::DataFlow);
        assert_eq!(d.version, 0);
        assert!(d.cells.is_empty());
    }
}
