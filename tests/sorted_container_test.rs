// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! End-to-end lifecycle tests for the spillable sorted row container.

use std::path::PathBuf;
use std::sync::Arc;

use arrow::array::{Int32Array, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use rand::seq::SliceRandom;
use tempfile::tempdir;

use spillsort::{
    Chunk, ForceSpillPolicy, MemTracker, OomAction, QuotaSpillPolicy, SortContainerOptions,
    SortExpression, SpillCodec, SpillIoExecutor, SpillPolicy, SpillableSortedRowContainer,
    format_bytes,
};

fn int_schema() -> SchemaRef {
    SchemaRef::new(Schema::new(vec![
        Field::new("c1", DataType::Int32, false),
        Field::new("c2", DataType::Int32, false),
        Field::new("c3", DataType::Utf8, false),
    ]))
}

fn int_chunk(schema: &SchemaRef, keys: &[i32]) -> Chunk {
    let payloads: Vec<String> = keys.iter().map(|k| format!("row-{k}")).collect();
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(Int32Array::from(keys.to_vec())),
            Arc::new(Int32Array::from(keys.to_vec())),
            Arc::new(StringArray::from(payloads)),
        ],
    )
    .unwrap();
    Chunk::new(batch)
}

fn options(spill_dir: PathBuf) -> SortContainerOptions {
    SortContainerOptions {
        label: "it-sort".to_string(),
        sort_exprs: vec![SortExpression::asc(0)],
        memory_quota_bytes: 0,
        oom_action: OomAction::Log,
        max_chunk_rows: 64,
        max_resident_bytes: 0,
        spill_dir,
        codec: SpillCodec::Lz4,
    }
}

fn container(
    spill_dir: PathBuf,
    policy: Arc<dyn SpillPolicy>,
    pool: Option<Arc<SpillIoExecutor>>,
) -> SpillableSortedRowContainer {
    SpillableSortedRowContainer::try_new(
        int_schema(),
        options(spill_dir),
        MemTracker::new_root("query-mem"),
        MemTracker::new_root("query-disk"),
        policy,
        pool,
    )
    .unwrap()
}

fn drain_keys(container: &mut SpillableSortedRowContainer) -> Vec<i32> {
    let mut reader = container.sorted_iter().unwrap();
    let mut keys = Vec::new();
    while let Some(chunk) = reader.next_chunk().unwrap() {
        let col = chunk
            .batch
            .column(0)
            .as_any()
            .downcast_ref::<Int32Array>()
            .unwrap();
        keys.extend(col.iter().map(|v| v.unwrap()));
        // Non-key columns stay attached to their key through spill and merge.
        let mirror = chunk
            .batch
            .column(1)
            .as_any()
            .downcast_ref::<Int32Array>()
            .unwrap();
        let payloads = chunk
            .batch
            .column(2)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        for ((k, m), p) in col.iter().zip(mirror.iter()).zip(payloads.iter()) {
            assert_eq!(k, m);
            assert_eq!(p.unwrap(), format!("row-{}", k.unwrap()));
        }
    }
    keys
}

fn shuffled(n: i32) -> Vec<i32> {
    let mut values: Vec<i32> = (0..n).collect();
    values.shuffle(&mut rand::rng());
    values
}

#[test]
fn large_shuffled_input_with_forced_spill() {
    let temp = tempdir().unwrap();
    let pool = SpillIoExecutor::new(2, 8);
    let mut container = container(
        temp.path().to_path_buf(),
        Arc::new(ForceSpillPolicy),
        Some(pool),
    );
    let schema = container.schema();

    let values = shuffled(1024);
    for window in values.chunks(100) {
        container.append(int_chunk(&schema, window)).unwrap();
    }
    container.seal().unwrap();
    assert!(container.has_spilled());

    let mem = Arc::clone(container.mem_tracker());
    let disk = Arc::clone(container.disk_tracker());
    assert!(mem.peak() > 0);
    assert!(disk.peak() > 0);
    assert_ne!(format_bytes(disk.peak()), "0 Bytes");

    let keys = drain_keys(&mut container);
    let expected: Vec<i32> = (0..1024).collect();
    assert_eq!(keys, expected);

    container.close();
    assert_eq!(mem.current(), 0);
    assert_eq!(disk.current(), 0);
    let leftovers: Vec<_> = std::fs::read_dir(temp.path()).unwrap().collect();
    assert!(leftovers.is_empty(), "spill files left behind");
}

#[test]
fn spilling_is_transparent_to_output() {
    let temp_forced = tempdir().unwrap();
    let temp_resident = tempdir().unwrap();
    let values = shuffled(300);

    let mut forced = container(
        temp_forced.path().to_path_buf(),
        Arc::new(ForceSpillPolicy),
        None,
    );
    let mut resident = container(
        temp_resident.path().to_path_buf(),
        Arc::new(QuotaSpillPolicy::new(0, 0.8)),
        None,
    );
    let schema = forced.schema();
    for window in values.chunks(37) {
        forced.append(int_chunk(&schema, window)).unwrap();
        resident.append(int_chunk(&schema, window)).unwrap();
    }
    forced.seal().unwrap();
    resident.seal().unwrap();
    assert!(forced.has_spilled());
    assert!(!resident.has_spilled());

    assert_eq!(drain_keys(&mut forced), drain_keys(&mut resident));
    // Disk never comes into play unless a spill actually happened.
    assert_eq!(resident.disk_tracker().peak(), 0);
    assert!(forced.disk_tracker().peak() > 0);
}

#[test]
fn low_quota_triggers_spill_through_policy() {
    let temp = tempdir().unwrap();
    let quota: u64 = 64 * 1024;
    let mut opts = options(temp.path().to_path_buf());
    opts.memory_quota_bytes = quota;
    let mut container = SpillableSortedRowContainer::try_new(
        int_schema(),
        opts,
        MemTracker::new_root("query-mem"),
        MemTracker::new_root("query-disk"),
        Arc::new(QuotaSpillPolicy::new(quota, 0.25)),
        None,
    )
    .unwrap();
    let schema = container.schema();

    let values = shuffled(2000);
    for window in values.chunks(200) {
        container.append(int_chunk(&schema, window)).unwrap();
        // Once a spill completes, consumption is back under the quota
        // before the append returns.
        assert!(
            container.memory_usage() <= quota as i64,
            "memory_usage={} quota={}",
            container.memory_usage(),
            quota
        );
    }
    container.seal().unwrap();
    assert!(container.has_spilled(), "quota never triggered a spill");
    assert!(container.spill_generation() >= 1);
    assert!(container.disk_tracker().peak() > 0);

    let keys = drain_keys(&mut container);
    let expected: Vec<i32> = (0..2000).collect();
    assert_eq!(keys, expected);

    let mem = Arc::clone(container.mem_tracker());
    let disk = Arc::clone(container.disk_tracker());
    container.close();
    assert_eq!(mem.current(), 0);
    assert_eq!(disk.current(), 0);
}

#[test]
fn oversized_final_run_spills_at_seal() {
    let temp = tempdir().unwrap();
    let mut opts = options(temp.path().to_path_buf());
    // Any non-empty final run exceeds the residency limit.
    opts.max_resident_bytes = 1;
    let mut container = SpillableSortedRowContainer::try_new(
        int_schema(),
        opts,
        MemTracker::new_root("query-mem"),
        MemTracker::new_root("query-disk"),
        Arc::new(QuotaSpillPolicy::new(0, 0.8)),
        None,
    )
    .unwrap();
    let schema = container.schema();

    container.append(int_chunk(&schema, &[4, 1, 3])).unwrap();
    container.append(int_chunk(&schema, &[2, 5])).unwrap();
    // No pressure during the build phase; the spill happens at seal.
    assert!(!container.has_spilled());
    container.seal().unwrap();
    assert!(container.has_spilled());
    assert_eq!(container.spill_generation(), 1);
    assert_eq!(container.memory_usage(), 0);
    assert!(container.disk_usage() > 0);

    assert_eq!(drain_keys(&mut container), vec![1, 2, 3, 4, 5]);

    let mem = Arc::clone(container.mem_tracker());
    let disk = Arc::clone(container.disk_tracker());
    container.close();
    assert_eq!(mem.current(), 0);
    assert_eq!(disk.current(), 0);
    let leftovers: Vec<_> = std::fs::read_dir(temp.path()).unwrap().collect();
    assert!(leftovers.is_empty(), "spill files left behind");
}

#[test]
fn spill_dir_removed_before_execution_is_recreated() {
    let temp = tempdir().unwrap();
    let spill_dir = temp.path().join("scratch").join("sort");
    std::fs::create_dir_all(&spill_dir).unwrap();
    let mut container = container(spill_dir.clone(), Arc::new(ForceSpillPolicy), None);
    let schema = container.schema();

    // Deleted before the first spill write; recreated on demand.
    std::fs::remove_dir_all(&spill_dir).unwrap();
    container.append(int_chunk(&schema, &[9, 3, 6])).unwrap();
    container.append(int_chunk(&schema, &[8, 1, 5])).unwrap();
    container.seal().unwrap();
    assert!(container.has_spilled());
    assert!(spill_dir.exists());
    assert_eq!(drain_keys(&mut container), vec![1, 3, 5, 6, 8, 9]);
}

#[test]
fn duplicate_and_descending_keys() {
    let temp = tempdir().unwrap();
    let mut opts = options(temp.path().to_path_buf());
    opts.sort_exprs = vec![SortExpression::desc(0)];
    let mut container = SpillableSortedRowContainer::try_new(
        int_schema(),
        opts,
        MemTracker::new_root("mem"),
        MemTracker::new_root("disk"),
        Arc::new(ForceSpillPolicy),
        None,
    )
    .unwrap();
    let schema = container.schema();
    container.append(int_chunk(&schema, &[5, 2, 5])).unwrap();
    container.append(int_chunk(&schema, &[2, 7])).unwrap();
    container.seal().unwrap();
    assert_eq!(drain_keys(&mut container), vec![7, 5, 5, 2, 2]);
}

#[test]
fn cancel_from_another_thread_stops_iteration() {
    let temp = tempdir().unwrap();
    let mut container = container(
        temp.path().to_path_buf(),
        Arc::new(ForceSpillPolicy),
        None,
    );
    let schema = container.schema();
    container
        .append(int_chunk(&schema, &shuffled(256)))
        .unwrap();
    container.seal().unwrap();

    let cancel = container.cancel_flag();
    let mut reader = container.sorted_iter().unwrap();
    assert!(reader.next_chunk().unwrap().is_some());

    let handle = std::thread::spawn(move || cancel.cancel());
    handle.join().unwrap();

    let err = reader.next_chunk().unwrap_err();
    assert!(err.is_cancelled());

    // Teardown after cancellation still releases every resource.
    drop(reader);
    let mem = Arc::clone(container.mem_tracker());
    let disk = Arc::clone(container.disk_tracker());
    container.close();
    assert_eq!(mem.current(), 0);
    assert_eq!(disk.current(), 0);
}

#[test]
fn lifecycle_misuse_is_rejected() {
    let temp = tempdir().unwrap();
    let mut container = container(
        temp.path().to_path_buf(),
        Arc::new(QuotaSpillPolicy::new(0, 0.8)),
        None,
    );
    let schema = container.schema();

    assert!(container.sorted_iter().is_err(), "iterate before seal");
    container.append(int_chunk(&schema, &[3, 1, 2])).unwrap();
    container.seal().unwrap();
    assert!(
        container.append(int_chunk(&schema, &[4])).is_err(),
        "append after seal"
    );
    assert!(container.seal().is_err(), "double seal");
    let first = container.sorted_iter();
    assert!(first.is_ok());
    assert!(container.sorted_iter().is_err(), "second iterator");
}

#[test]
fn drop_mid_lifecycle_cleans_up() {
    let temp = tempdir().unwrap();
    let mem = MemTracker::new_root("mem");
    let disk = MemTracker::new_root("disk");
    {
        let mut container = SpillableSortedRowContainer::try_new(
            int_schema(),
            options(temp.path().to_path_buf()),
            Arc::clone(&mem),
            Arc::clone(&disk),
            Arc::new(ForceSpillPolicy),
            None,
        )
        .unwrap();
        let schema = container.schema();
        container
            .append(int_chunk(&schema, &shuffled(128)))
            .unwrap();
        // Dropped without seal or iteration.
    }
    assert_eq!(mem.current(), 0);
    assert_eq!(disk.current(), 0);
    let leftovers: Vec<_> = std::fs::read_dir(temp.path()).unwrap().collect();
    assert!(leftovers.is_empty(), "spill files left behind");
}
