mod common;

use std::time::Duration;

use common::logging::tracing_logger;
use common::test_cluster::TestCluster;
use ssp_ps::config_models::ConsistencyModel;
use ssp_ps::errors::PsError;
use tokio_util::sync::CancellationToken;

const TABLE: i32 = 0;

#[test]
fn concurrent_increments_are_all_applied() -> anyhow::Result<()> {
    tracing_logger();
    let cluster = TestCluster::single(
        TestCluster::config(ConsistencyModel::Ssp, 1),
        &[(TABLE, TestCluster::table_config(0, 4))],
    )?;
    let group = cluster.group(0).clone();
    let threads = vec![group.register_thread()?, group.register_thread()?];

    let handles: Vec<_> = threads
        .into_iter()
        .map(|mut thread| {
            std::thread::spawn(move || -> anyhow::Result<f32> {
                for _ in 0..1000 {
                    thread.inc(TABLE, 0, 0, 1.0)?;
                }
                thread.clock_tick()?;
                thread.global_barrier()?;
                Ok(thread.get(TABLE, 0)?.get(0))
            })
        })
        .collect();
    for handle in handles {
        let value = handle.join().expect("app thread panicked")?;
        assert_eq!(2000.0, value);
    }

    cluster.shutdown();
    Ok(())
}

#[test]
fn own_increments_are_visible_to_stale_reads() -> anyhow::Result<()> {
    tracing_logger();
    let cluster = TestCluster::single(
        TestCluster::config(ConsistencyModel::Ssp, 1),
        &[(TABLE, TestCluster::table_config(2, 4))],
    )?;
    let mut thread = cluster.group(0).register_thread()?;

    thread.batch_inc(TABLE, 3, &[0, 2], &[1.0, -2.0])?;
    thread.clock_tick()?;
    let row = thread.get(TABLE, 3)?;
    assert_eq!(vec![1.0, 0.0, -2.0, 0.0], row.to_dense());

    // cached row is updated in place
    thread.inc(TABLE, 3, 1, 5.0)?;
    assert_eq!(5.0, thread.get(TABLE, 3)?.get(1));

    drop(thread);
    cluster.shutdown();
    Ok(())
}

#[test]
fn reads_block_until_slowest_thread_is_within_staleness() -> anyhow::Result<()> {
    tracing_logger();
    let cluster = TestCluster::single(
        TestCluster::config(ConsistencyModel::Ssp, 1),
        &[(TABLE, TestCluster::table_config(0, 4))],
    )?;
    let group = cluster.group(0).clone();
    let mut fast = group.register_thread()?;
    let mut slow = group.register_thread()?;

    fast.inc(TABLE, 1, 0, 1.0)?;
    slow.inc(TABLE, 1, 0, 2.0)?;
    fast.clock_tick()?;

    let cancel = CancellationToken::new();
    let canceller = {
        let cancel = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            cancel.cancel();
        })
    };
    let blocked = fast.get_cancellable(TABLE, 1, &cancel);
    assert!(matches!(blocked, Err(PsError::Cancelled)));
    canceller.join().expect("canceller panicked");

    slow.clock_tick()?;
    assert_eq!(3.0, fast.get(TABLE, 1)?.get(0));

    drop(fast);
    drop(slow);
    cluster.shutdown();
    Ok(())
}

#[test]
fn stale_cached_rows_are_refreshed_past_the_staleness_bound() -> anyhow::Result<()> {
    tracing_logger();
    let cluster = TestCluster::start(
        2,
        TestCluster::config(ConsistencyModel::Ssp, 1),
        &[(TABLE, TestCluster::table_config(2, 4))],
    )?;
    let mut reader = cluster.group(0).register_thread()?;
    let mut writer = cluster.group(1).register_thread()?;

    let cached = reader.get(TABLE, 0)?;
    assert_eq!(0, cached.clock());
    assert_eq!(0.0, cached.get(0));

    writer.inc(TABLE, 0, 0, 5.0)?;
    for _ in 0..5 {
        writer.clock_tick()?;
    }

    // within two clocks of the cached copy, the cache still serves reads
    reader.clock_tick()?;
    reader.clock_tick()?;
    let row = reader.get(TABLE, 0)?;
    assert_eq!(0, row.clock());
    assert_eq!(0.0, row.get(0));

    for _ in 0..3 {
        reader.clock_tick()?;
    }
    assert_eq!(5, reader.clock());
    let row = reader.get(TABLE, 0)?;
    assert!(row.clock() >= 3, "row clock {}", row.clock());
    assert_eq!(5.0, row.get(0));

    drop(reader);
    drop(writer);
    cluster.shutdown();
    Ok(())
}

#[test]
fn thread_cache_reads_own_thread_increments() -> anyhow::Result<()> {
    tracing_logger();
    let cluster = TestCluster::single(
        TestCluster::config(ConsistencyModel::Ssp, 1),
        &[(TABLE, TestCluster::table_config(0, 4))],
    )?;
    let mut thread = cluster.group(0).register_thread()?;

    thread.thread_inc(TABLE, 2, 1, 4.0)?;
    thread.thread_batch_inc(TABLE, 2, &[1, 3], &[1.0, 1.0])?;
    assert_eq!(5.0, thread.thread_get(TABLE, 2, 1)?);

    thread.clock_tick()?;
    thread.global_barrier()?;
    let row = thread.get(TABLE, 2)?;
    assert_eq!(vec![0.0, 5.0, 0.0, 1.0], row.to_dense());

    drop(thread);
    cluster.shutdown();
    Ok(())
}

#[test]
fn async_gets_prefetch_rows() -> anyhow::Result<()> {
    tracing_logger();
    let mut config = TestCluster::config(ConsistencyModel::Ssp, 1);
    config.max_pending_async_get_cnt = 4;
    let cluster = TestCluster::single(config, &[(TABLE, TestCluster::table_config(0, 4))])?;
    let mut thread = cluster.group(0).register_thread()?;

    for row_id in 0..10 {
        thread.dense_batch_inc(TABLE, row_id, 0, &[1.0, 2.0])?;
    }
    thread.clock_tick()?;
    for row_id in 0..10 {
        thread.get_async(TABLE, row_id)?;
        assert!(thread.num_pending_async_get() <= 4);
    }
    thread.wait_pending_async_get()?;
    assert_eq!(0, thread.num_pending_async_get());
    for row_id in 0..10 {
        assert_eq!(vec![1.0, 2.0, 0.0, 0.0], thread.get(TABLE, row_id)?.to_dense());
    }

    drop(thread);
    cluster.shutdown();
    Ok(())
}

#[test]
fn two_clients_share_tables() -> anyhow::Result<()> {
    tracing_logger();
    let cluster = TestCluster::start(
        2,
        TestCluster::config(ConsistencyModel::Ssp, 1),
        &[(TABLE, TestCluster::table_config(1, 8))],
    )?;

    let handles: Vec<_> = cluster
        .groups
        .iter()
        .enumerate()
        .map(|(client_id, group)| -> anyhow::Result<_> {
            let mut thread = group.register_thread()?;
            Ok(std::thread::spawn(move || -> anyhow::Result<Vec<f32>> {
                let delta = client_id as f32 + 1.0;
                for _ in 0..3 {
                    for row_id in 0..8 {
                        thread.inc(TABLE, row_id, row_id, delta)?;
                    }
                    thread.clock_tick()?;
                }
                thread.global_barrier()?;
                (0..8)
                    .map(|row_id| Ok(thread.get(TABLE, row_id)?.get(row_id)))
                    .collect()
            }))
        })
        .collect::<anyhow::Result<_>>()?;

    for handle in handles {
        let values = handle.join().expect("app thread panicked")?;
        assert_eq!(vec![9.0; 8], values);
    }
    assert!(cluster.bus.inter_proc_bytes() > 0);

    cluster.shutdown();
    Ok(())
}
