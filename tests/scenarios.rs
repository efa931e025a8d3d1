//! End-to-end scenarios against a real [`InMemoryConnection`], covering the
//! documented single-process, chained, fan-in, fan-out, and nested-engine
//! cases one at a time.

use dataflow_bus::{
    async_transform, sync_transform, sync_transform_fn, Connection, InMemoryConnection, PubSub, Topic, Value, IN, OUT,
};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

fn add_one(v: Value) -> Value {
    Value::from(v.as_i64().expect("expected an integer") + 1)
}

fn fresh_connection() -> Arc<dyn Connection> {
    Arc::new(InMemoryConnection::new())
}

#[test_log::test(tokio::test)]
async fn s1_single_process() {
    let connection = fresh_connection();
    let process = IN
        .subscribe()
        .transform(sync_transform_fn(|v| Ok(add_one(v))))
        .sink(OUT.publish());
    let engine = PubSub::new(vec![process], connection.clone());

    assert_eq!(engine.invoke(Value::from(2)).await.unwrap(), Some(Value::from(3)));
    assert!(connection.listeners().is_empty());
}

#[test_log::test(tokio::test)]
async fn s2_two_processes_in_series() {
    let connection = fresh_connection();
    let one = Topic::new("one");
    let first = IN
        .subscribe()
        .transform(sync_transform_fn(|v| Ok(add_one(v))))
        .sink(one.publish());
    let second = one
        .subscribe()
        .transform(sync_transform_fn(|v| Ok(add_one(v))))
        .sink(OUT.publish());
    let engine = PubSub::new(vec![first, second], connection.clone());

    assert_eq!(engine.invoke(Value::from(2)).await.unwrap(), Some(Value::from(4)));
    assert!(connection.listeners().is_empty());
}

#[test_log::test(tokio::test)]
async fn s3_hundred_process_chain_no_leak_across_ten_runs() {
    let connection = fresh_connection();
    let topics: Vec<Topic> = (0..99).map(|i| Topic::new(format!("t{i}"))).collect();

    let mut processes = Vec::with_capacity(100);
    processes.push(
        IN.subscribe()
            .transform(sync_transform_fn(|v| Ok(add_one(v))))
            .sink(topics[0].publish()),
    );
    for i in 1..99 {
        processes.push(
            topics[i - 1]
                .subscribe()
                .transform(sync_transform_fn(|v| Ok(add_one(v))))
                .sink(topics[i].publish()),
        );
    }
    processes.push(
        topics[98]
            .subscribe()
            .transform(sync_transform_fn(|v| Ok(add_one(v))))
            .sink(OUT.publish()),
    );
    let engine = PubSub::new(processes, connection.clone());

    for _ in 0..10 {
        assert_eq!(engine.invoke(Value::from(2)).await.unwrap(), Some(Value::from(102)));
        assert!(connection.listeners().is_empty());
    }
}

#[test_log::test(tokio::test)]
async fn s4_fan_in_join() {
    let connection = fresh_connection();
    let one = Topic::new("one");
    let two = Topic::new("two");

    let a = IN
        .subscribe()
        .transform(sync_transform_fn(|v| Ok(add_one(v))))
        .sink(one.publish());
    let b = one
        .subscribe()
        .transform(sync_transform_fn(|v| Ok(add_one(v))))
        .sink(two.publish());
    let c = IN
        .subscribe()
        .transform(sync_transform_fn(|v| Ok(add_one(v))))
        .sink(two.publish());
    let d = two
        .join()
        .transform(sync_transform_fn(|v| {
            let mut nums: Vec<i64> = v
                .as_array()
                .expect("join delivers a list")
                .iter()
                .map(|x| x.as_i64().expect("expected an integer") + 10)
                .collect();
            nums.sort_unstable();
            Ok(Value::from(nums))
        }))
        .sink(OUT.publish());
    let engine = PubSub::new(vec![a, b, c, d], connection.clone());

    assert_eq!(
        engine.invoke(Value::from(2)).await.unwrap(),
        Some(Value::from(vec![13, 14]))
    );
    assert!(connection.listeners().is_empty());
}

#[test_log::test(tokio::test)]
async fn s5_publish_each_then_join_then_subscribe() {
    let connection = fresh_connection();
    let one = Topic::new("one");
    let two = Topic::new("two");

    let a = IN
        .subscribe()
        .transform(sync_transform_fn(|v| {
            let bumped: Vec<Value> = v
                .as_array()
                .expect("expected a list input")
                .iter()
                .map(|x| Value::from(x.as_i64().expect("expected an integer") + 10))
                .collect();
            Ok(Value::from(bumped))
        }))
        .sink(one.publish_each());
    let b = one
        .join()
        .transform(sync_transform_fn(|v| {
            let total: i64 = v
                .as_array()
                .expect("join delivers a list")
                .iter()
                .map(|x| x.as_i64().expect("expected an integer"))
                .sum();
            Ok(Value::from(total))
        }))
        .sink(two.publish());
    let c = two
        .subscribe()
        .transform(sync_transform_fn(|v| Ok(add_one(v))))
        .sink(OUT.publish());
    let engine = PubSub::new(vec![a, b, c], connection.clone());

    let input = Value::from(vec![2, 3]);
    let messages: Vec<_> = engine
        .stream(input.clone())
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .map(|m| m.expect("run should not fail"))
        .collect();

    let observed: Vec<(String, Value)> = messages
        .iter()
        .map(|m| (m.topic.clone(), m.value.clone()))
        .collect();
    assert_eq!(
        observed,
        vec![
            ("__in__".to_string(), input.clone()),
            ("one".to_string(), Value::from(12)),
            ("one".to_string(), Value::from(13)),
            ("two".to_string(), Value::from(25)),
            ("__out__".to_string(), Value::from(26)),
        ]
    );
    assert!(messages.iter().all(|m| m.correlation_value == input));
    assert!(connection.listeners().is_empty());
}

#[test_log::test(tokio::test)]
async fn s6_two_processes_publish_to_out_first_wins() {
    let connection = fresh_connection();
    let a = IN
        .subscribe()
        .transform(sync_transform_fn(|v| Ok(add_one(v))))
        .sink(OUT.publish());
    let b = IN
        .subscribe()
        .transform(sync_transform_fn(|v| Ok(add_one(v))))
        .sink(OUT.publish());
    let engine = PubSub::new(vec![a, b], connection.clone());

    assert_eq!(engine.invoke(Value::from(2)).await.unwrap(), Some(Value::from(3)));
    assert!(connection.listeners().is_empty());
}

#[test_log::test(tokio::test)]
async fn s7_no_out_returns_none() {
    let connection = fresh_connection();
    let nowhere = Topic::new("nowhere");
    let process = IN
        .subscribe()
        .transform(sync_transform_fn(|v| Ok(add_one(v))))
        .sink(nowhere.publish());
    let engine = PubSub::new(vec![process], connection.clone());

    assert_eq!(engine.invoke(Value::from(2)).await.unwrap(), None);
    assert!(connection.listeners().is_empty());
}

#[test_log::test(tokio::test)]
async fn s8_nested_engine_via_map() {
    let connection = fresh_connection();

    let inner_process = IN
        .subscribe()
        .transform(sync_transform_fn(|v| Ok(add_one(v))))
        .sink(OUT.publish());
    let inner = PubSub::new(vec![inner_process], connection.clone());

    let doubled = Topic::new("doubled");
    let presum = Topic::new("presum");
    let almost = Topic::new("almost");

    let fan_out = IN.subscribe().transform(inner.map()).sink(doubled.publish_each());
    let joiner = doubled
        .join()
        .transform(sync_transform_fn(|v| {
            let mut nums: Vec<i64> = v
                .as_array()
                .expect("join delivers a list")
                .iter()
                .map(|x| x.as_i64().expect("expected an integer") + 10)
                .collect();
            nums.sort_unstable();
            Ok(Value::from(nums))
        }))
        .sink(presum.publish());
    let passthrough = presum
        .subscribe()
        .transform(sync_transform_fn(|v| Ok(v)))
        .sink(almost.publish());
    let summer = almost
        .subscribe()
        .transform(sync_transform_fn(|v| {
            let total: i64 = v
                .as_array()
                .expect("expected a list")
                .iter()
                .map(|x| x.as_i64().expect("expected an integer"))
                .sum();
            Ok(Value::from(total))
        }))
        .sink(OUT.publish());

    let outer = PubSub::new(vec![fan_out, joiner, passthrough, summer], connection.clone());

    let input = Value::from(vec![2, 3]);
    let messages: Vec<_> = outer
        .stream(input)
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .map(|m| m.expect("run should not fail"))
        .collect();

    assert_eq!(messages.len(), 6);
    assert_eq!(messages.last().unwrap().topic, "__out__");
    assert_eq!(messages.last().unwrap().value, Value::from(27));
    assert!(connection.listeners().is_empty());
}

#[test_log::test(tokio::test)]
async fn batch_preserves_order_and_isolation() {
    let connection = fresh_connection();
    let process = IN
        .subscribe()
        .transform(sync_transform_fn(|v| Ok(add_one(v))))
        .sink(OUT.publish());
    let engine = PubSub::new(vec![process], connection.clone());

    let inputs: Vec<Value> = (0..20).map(Value::from).collect();
    let results = engine.batch(inputs.clone()).await;

    let values: Vec<Option<Value>> = results
        .into_iter()
        .map(|r| r.expect("no process in this suite fails"))
        .collect();
    let expected: Vec<Option<Value>> = inputs
        .into_iter()
        .map(|v| Some(Value::from(v.as_i64().unwrap() + 1)))
        .collect();
    assert_eq!(values, expected);
    assert!(connection.listeners().is_empty());
}

#[test_log::test(tokio::test)]
async fn stream_abandonment_tears_down_listeners() {
    let connection = fresh_connection();
    let slow = Topic::new("slow");
    let process = IN
        .subscribe()
        .transform(async_transform(|v, _correlation_value| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(add_one(v))
        }))
        .sink(slow.publish());
    let engine = PubSub::new(vec![process], connection.clone());

    {
        let mut stream = engine.stream(Value::from(1));
        let _first = stream.next().await;
        // drop the stream mid-run, before the slow transform has finished
    }

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(connection.listeners().is_empty());
}

#[test_log::test(tokio::test)]
async fn join_with_zero_messages_keeps_the_run_correlation_value() {
    let connection = fresh_connection();
    let empty = Topic::new("empty");

    // publish_each on an empty array emits zero messages, so `empty.join()`
    // fires with an empty buffered list — a reachable state, not an error.
    let producer = IN
        .subscribe()
        .transform(sync_transform_fn(|_v| Ok(Value::Array(Vec::new()))))
        .sink(empty.publish_each());
    let joiner = empty
        .join()
        .transform(sync_transform(|_v, correlation_value| Ok(correlation_value)))
        .sink(OUT.publish());
    let engine = PubSub::new(vec![producer, joiner], connection.clone());

    assert_eq!(engine.invoke(Value::from(7)).await.unwrap(), Some(Value::from(7)));
    assert!(connection.listeners().is_empty());
}

#[test_log::test(tokio::test)]
async fn chained_sinks_fan_out_the_same_value_unchanged() {
    let connection = fresh_connection();
    let also = Topic::new("also");
    let process = IN
        .subscribe()
        .transform(sync_transform_fn(|v| Ok(add_one(v))))
        .sink(OUT.publish())
        .sink(also.publish());
    let engine = PubSub::new(vec![process], connection.clone());

    let messages: Vec<_> = engine
        .stream(Value::from(2))
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .map(|m| m.expect("run should not fail"))
        .collect();

    let also_message = messages
        .iter()
        .find(|m| m.topic == "also")
        .expect("chained sink should have published to `also`");
    assert_eq!(also_message.value, Value::from(3));
    assert!(connection.listeners().is_empty());
}
