mod common;

use common::{numbers, payloads, reaching, run};
use marblecore::{ConnectLine, Element, GraphDocument, SimulationEvent, StageType, Value};
use marbleruntime::SimulationStatus;

const THROW_ON_THREE: &str = r#"if value == 3 { throw "boom" } true"#;

fn source(values: &[i64]) -> Element {
    Element::new("src", StageType::Of).with_property("values", Value::Array(numbers(values)))
}

#[tokio::test]
async fn test_filtered_value_reaches_subscriber() {
    let mut doc = GraphDocument::new("scenario-a");
    doc.add_element(source(&[1, 2, 3]));
    doc.add_element(Element::new("filter", StageType::Filter).with_property("expression", "value % 2 == 0"));
    doc.add_element(Element::new("sink", StageType::Subscriber));
    doc.connect("l1", "src", "filter");
    doc.connect("l2", "filter", "sink");

    let (outcome, events) = run(&doc).await;

    assert_eq!(outcome.status, SimulationStatus::Completed);
    let arrived = reaching(&events, "sink");
    assert_eq!(arrived.len(), 1);
    assert_eq!(arrived[0].source_element_id(), "filter");
    assert_eq!(arrived[0].payload(), &Value::from(2));
    assert_eq!(arrived[0].connect_lines_id(), ["l2".to_string()]);
    assert_eq!(payloads(&reaching(&events, "filter")), numbers(&[1, 2, 3]));
    assert_eq!(outcome.open_paths, 0);
}

#[tokio::test]
async fn test_unhandled_error_is_fatal() {
    let mut doc = GraphDocument::new("scenario-b");
    doc.add_element(source(&[1, 2, 3, 4]));
    doc.add_element(Element::new("filter", StageType::Filter).with_property("expression", THROW_ON_THREE));
    doc.add_element(Element::new("sink", StageType::Subscriber));
    doc.connect("l1", "src", "filter");
    doc.connect("l2", "filter", "sink");

    let (outcome, events) = run(&doc).await;

    assert_eq!(outcome.status, SimulationStatus::Failed);
    let fatal: Vec<_> = events.iter().filter(|e| e.is_fatal()).collect();
    assert_eq!(fatal.len(), 1);
    assert!(events.last().unwrap().is_fatal(), "fatal must be the last event");

    match fatal[0] {
        SimulationEvent::Fatal {
            source_element_id,
            target_element_id,
            connect_line_id,
            error,
            ..
        } => {
            assert_eq!(source_element_id, "filter");
            assert_eq!(target_element_id, "sink");
            assert_eq!(connect_line_id, "l2");
            assert_eq!(error, &Value::from("boom"));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(payloads(&reaching(&events, "sink")), numbers(&[1, 2]));
    assert_eq!(outcome.open_paths, 0);
}

#[tokio::test]
async fn test_caught_error_resumes_with_recovery() {
    let mut doc = GraphDocument::new("scenario-c").with_root("src");
    doc.add_element(source(&[1, 2, 3]));
    doc.add_element(Element::new("filter", StageType::Filter).with_property("expression", THROW_ON_THREE));
    doc.add_element(Element::new("catch", StageType::CatchError));
    doc.add_element(Element::new("fallback", StageType::Of).with_property("values", vec![0]));
    doc.add_element(Element::new("sink", StageType::Subscriber));
    doc.connect("l1", "src", "filter");
    doc.connect("l2", "filter", "catch");
    doc.connect("l3", "catch", "sink");
    doc.connect("rec", "catch", "fallback");

    let (outcome, events) = run(&doc).await;

    assert_eq!(outcome.status, SimulationStatus::Completed);
    assert!(events.iter().all(|e| !e.is_fatal()));

    let arrived = reaching(&events, "sink");
    assert_eq!(payloads(&arrived), numbers(&[1, 2, 0]));
    for event in &arrived[..2] {
        assert_eq!(event.source_element_id(), "filter");
        assert_eq!(event.connect_lines_id(), ["l2".to_string(), "l3".to_string()]);
    }

    let errors: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, SimulationEvent::Error { .. }))
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].source_element_id(), "filter");
    assert_eq!(errors[0].target_element_id(), "catch");
    assert_eq!(errors[0].connect_lines_id(), ["l2".to_string()]);

    let recovered = arrived[2];
    assert_eq!(recovered.source_element_id(), "fallback");
    assert_eq!(recovered.connect_lines_id(), ["rec".to_string(), "l3".to_string()]);
    assert_ne!(recovered.value_id(), errors[0].value_id());
    assert!(recovered.index() > errors[0].index());
    assert_eq!(outcome.open_paths, 0);
}

#[tokio::test]
async fn test_merged_values_keep_their_reference_edge() {
    let mut doc = GraphDocument::new("scenario-d");
    doc.add_element(Element::new("merge", StageType::Merge));
    doc.add_element(Element::new("a", StageType::Of).with_property("values", vec![1, 2]));
    doc.add_element(Element::new("b", StageType::Of).with_property("values", vec![10, 20]));
    doc.add_element(Element::new("sink", StageType::Subscriber));
    doc.connect("out", "merge", "sink");
    doc.add_connect_line(ConnectLine::new("ra", "merge", "a").with_index(0));
    doc.add_connect_line(ConnectLine::new("rb", "merge", "b").with_index(1));

    let (outcome, events) = run(&doc).await;

    assert_eq!(outcome.status, SimulationStatus::Completed);
    assert_eq!(events.len(), 4);
    for event in &events {
        let n = event.payload().as_i64().unwrap();
        let (origin, reference) = if n < 10 { ("a", "ra") } else { ("b", "rb") };
        assert_eq!(event.source_element_id(), origin);
        assert_eq!(event.target_element_id(), "sink");
        assert_eq!(event.connect_lines_id(), [reference.to_string(), "out".to_string()]);
    }
    let mut all = payloads(&events.iter().collect::<Vec<_>>());
    all.sort_by(|x, y| x.as_f64().partial_cmp(&y.as_f64()).unwrap());
    assert_eq!(all, numbers(&[1, 2, 10, 20]));
    assert_eq!(outcome.open_paths, 0);
}

#[tokio::test]
async fn test_pass_through_chain_reports_single_hops() {
    let mut doc = GraphDocument::new("chain");
    doc.add_element(source(&[1, 2]));
    let stages = ["m1", "m2", "m3"];
    for id in stages {
        doc.add_element(Element::new(id, StageType::Map).with_property("expression", "value + 1"));
    }
    doc.add_element(Element::new("sink", StageType::Subscriber));
    doc.connect("l0", "src", "m1");
    doc.connect("l1", "m1", "m2");
    doc.connect("l2", "m2", "m3");
    doc.connect("l3", "m3", "sink");

    let (_, events) = run(&doc).await;

    assert_eq!(events.len(), 8);
    assert!(events.iter().all(|e| e.connect_lines_id().len() == 1));
    assert_eq!(payloads(&reaching(&events, "sink")), numbers(&[4, 5]));

    let first = &events[0];
    let hops: Vec<_> = events
        .iter()
        .filter(|e| e.value_id() == first.value_id())
        .map(|e| e.connect_lines_id()[0].clone())
        .collect();
    assert_eq!(hops, ["l0", "l1", "l2", "l3"]);
}

#[tokio::test]
async fn test_event_indexes_are_monotonic() {
    let mut doc = GraphDocument::new("indexes");
    doc.add_element(source(&[1, 2, 3]));
    doc.add_element(Element::new("sink", StageType::Subscriber));
    doc.connect("l1", "src", "sink");

    let (_, events) = run(&doc).await;

    let indexes: Vec<_> = events.iter().map(SimulationEvent::index).collect();
    assert_eq!(indexes, vec![0, 1, 2]);
}
