//! Graph model supplied by the editor: stages, connect lines and the
//! document that bundles them.

use crate::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type ElementId = String;
pub type ConnectLineId = String;

/// Complete graph description as saved by the editor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphDocument {
    pub name: String,
    #[serde(default)]
    pub elements: Vec<Element>,
    #[serde(default)]
    pub connect_lines: Vec<ConnectLine>,
    /// Entry stage the simulation starts from. Inferred when absent.
    #[serde(default)]
    pub root: Option<ElementId>,
    #[serde(default)]
    pub settings: SimulationSettings,
}

impl GraphDocument {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            elements: Vec::new(),
            connect_lines: Vec::new(),
            root: None,
            settings: SimulationSettings::default(),
        }
    }

    pub fn add_element(&mut self, element: Element) -> ElementId {
        let id = element.id.clone();
        self.elements.push(element);
        id
    }

    /// Connect `source` to `target`. Whether this is a direct or a reference
    /// edge follows from the target's stage type.
    pub fn connect(
        &mut self,
        id: impl Into<ConnectLineId>,
        source: impl Into<ElementId>,
        target: impl Into<ElementId>,
    ) -> ConnectLineId {
        self.add_connect_line(ConnectLine::new(id, source, target))
    }

    pub fn add_connect_line(&mut self, line: ConnectLine) -> ConnectLineId {
        let id = line.id.clone();
        self.connect_lines.push(line);
        id
    }

    pub fn with_root(mut self, root: impl Into<ElementId>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn find_element(&self, id: &str) -> Option<&Element> {
        self.elements.iter().find(|e| e.id == id)
    }
}

/// A pipeline stage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    pub id: ElementId,
    #[serde(rename = "type")]
    pub stage_type: StageType,
    #[serde(default)]
    pub properties: HashMap<String, Value>,
    /// Only meaningful to the renderer.
    #[serde(default)]
    pub position: Option<Position>,
}

impl Element {
    pub fn new(id: impl Into<ElementId>, stage_type: StageType) -> Self {
        Self {
            id: id.into(),
            stage_type,
            properties: HashMap::new(),
            position: None,
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_position(mut self, x: f32, y: f32) -> Self {
        self.position = Some(Position { x, y });
        self
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }
}

/// Directed, named, indexed edge between two stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectLine {
    pub id: ConnectLineId,
    pub source: ConnectPoint,
    pub target: ConnectPoint,
    /// Ordering among sibling references into the same consumer.
    #[serde(default)]
    pub index: u32,
    /// Key for consumers that need named nested pipelines.
    #[serde(default)]
    pub name: Option<String>,
}

impl ConnectLine {
    pub fn new(
        id: impl Into<ConnectLineId>,
        source: impl Into<ElementId>,
        target: impl Into<ElementId>,
    ) -> Self {
        Self {
            id: id.into(),
            source: ConnectPoint::new(source),
            target: ConnectPoint::new(target),
            index: 0,
            name: None,
        }
    }

    pub fn with_index(mut self, index: u32) -> Self {
        self.index = index;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectPoint {
    pub element_id: ElementId,
    #[serde(default, rename = "type")]
    pub point_type: Option<String>,
    #[serde(default)]
    pub position: Option<Position>,
}

impl ConnectPoint {
    pub fn new(element_id: impl Into<ElementId>) -> Self {
        Self {
            element_id: element_id.into(),
            point_type: None,
            position: None,
        }
    }
}

/// Position in the visual editor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

/// Per-document simulation settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationSettings {
    /// Stop the run after this many milliseconds.
    #[serde(default)]
    pub max_duration_ms: Option<u64>,
}

/// Broad family a stage belongs to; decides how it is wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageCategory {
    Creation,
    Transform,
    ErrorHandling,
    JoinCreation,
    Subscriber,
}

/// Every stage the simulator knows how to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StageType {
    Of,
    From,
    Range,
    Interval,
    Timer,
    Empty,
    ThrowError,
    Defer,
    Map,
    Filter,
    Scan,
    Take,
    Skip,
    Delay,
    MergeMap,
    ConcatMap,
    SwitchMap,
    CatchError,
    Merge,
    Concat,
    Race,
    Zip,
    CombineLatest,
    ForkJoin,
    Subscriber,
}

impl StageType {
    pub const ALL: [StageType; 25] = [
        StageType::Of,
        StageType::From,
        StageType::Range,
        StageType::Interval,
        StageType::Timer,
        StageType::Empty,
        StageType::ThrowError,
        StageType::Defer,
        StageType::Map,
        StageType::Filter,
        StageType::Scan,
        StageType::Take,
        StageType::Skip,
        StageType::Delay,
        StageType::MergeMap,
        StageType::ConcatMap,
        StageType::SwitchMap,
        StageType::CatchError,
        StageType::Merge,
        StageType::Concat,
        StageType::Race,
        StageType::Zip,
        StageType::CombineLatest,
        StageType::ForkJoin,
        StageType::Subscriber,
    ];

    pub fn category(self) -> StageCategory {
        use StageType::*;
        match self {
            Of | From | Range | Interval | Timer | Empty | ThrowError | Defer => {
                StageCategory::Creation
            }
            Map | Filter | Scan | Take | Skip | Delay | MergeMap | ConcatMap | SwitchMap => {
                StageCategory::Transform
            }
            CatchError => StageCategory::ErrorHandling,
            Merge | Concat | Race | Zip | CombineLatest | ForkJoin => StageCategory::JoinCreation,
            Subscriber => StageCategory::Subscriber,
        }
    }

    /// Entry stages have no upstream; any edge into one is a reference edge.
    pub fn is_entry(self) -> bool {
        matches!(
            self.category(),
            StageCategory::Creation | StageCategory::JoinCreation
        )
    }

    pub fn is_error_handler(self) -> bool {
        self.category() == StageCategory::ErrorHandling
    }

    pub fn is_terminal(self) -> bool {
        self.category() == StageCategory::Subscriber
    }

    /// Whether values coming out of this stage's nested pipelines are
    /// forwarded with their identity, as opposed to being folded into new
    /// values.
    pub fn forwards_nested_values(self) -> bool {
        use StageType::*;
        matches!(
            self,
            Defer | MergeMap | ConcatMap | SwitchMap | CatchError | Merge | Concat | Race
        )
    }

    pub fn as_str(self) -> &'static str {
        use StageType::*;
        match self {
            Of => "of",
            From => "from",
            Range => "range",
            Interval => "interval",
            Timer => "timer",
            Empty => "empty",
            ThrowError => "throwError",
            Defer => "defer",
            Map => "map",
            Filter => "filter",
            Scan => "scan",
            Take => "take",
            Skip => "skip",
            Delay => "delay",
            MergeMap => "mergeMap",
            ConcatMap => "concatMap",
            SwitchMap => "switchMap",
            CatchError => "catchError",
            Merge => "merge",
            Concat => "concat",
            Race => "race",
            Zip => "zip",
            CombineLatest => "combineLatest",
            ForkJoin => "forkJoin",
            Subscriber => "subscriber",
        }
    }
}

impl std::fmt::Display for StageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_editor_document() {
        let json = r#"{
            "name": "catch",
            "elements": [
                {"id": "src", "type": "of", "properties": {"values": [1, 2, 3]}, "position": {"x": 10.0, "y": 20.0}},
                {"id": "handler", "type": "catchError"},
                {"id": "recover", "type": "of", "properties": {"values": [0]}},
                {"id": "sink", "type": "subscriber"}
            ],
            "connectLines": [
                {"id": "l1", "source": {"elementId": "src", "type": "output"}, "target": {"elementId": "handler"}},
                {"id": "l2", "source": {"elementId": "handler"}, "target": {"elementId": "sink"}},
                {"id": "r1", "source": {"elementId": "handler"}, "target": {"elementId": "recover"}, "index": 0, "name": "recovery"}
            ],
            "settings": {"maxDurationMs": 500}
        }"#;

        let document: GraphDocument = serde_json::from_str(json).unwrap();

        assert_eq!(document.elements.len(), 4);
        assert_eq!(document.connect_lines[2].name.as_deref(), Some("recovery"));
        assert_eq!(document.connect_lines[0].source.point_type.as_deref(), Some("output"));
        assert_eq!(document.settings.max_duration_ms, Some(500));
        assert_eq!(
            document.find_element("handler").map(|e| e.stage_type),
            Some(StageType::CatchError)
        );
        assert!(document.root.is_none());
    }

    #[test]
    fn stage_tags_match_serde_names() {
        for stage_type in StageType::ALL {
            let json = serde_json::to_string(&stage_type).unwrap();
            assert_eq!(json, format!("\"{}\"", stage_type.as_str()));
        }
    }

    #[test]
    fn entry_stages_are_creation_or_join() {
        assert!(StageType::Of.is_entry());
        assert!(StageType::Merge.is_entry());
        assert!(!StageType::Map.is_entry());
        assert!(!StageType::CatchError.is_entry());
        assert!(StageType::CatchError.is_error_handler());
        assert!(StageType::Subscriber.is_terminal());
    }
}
