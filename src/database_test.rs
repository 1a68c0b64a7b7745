use anyhow::{Context, Result};

use crate::chunks::ChunkCreateSpec;
use crate::config::Config;
use crate::database::Database;
use crate::master::{ChunkMaster, Mutation};
use crate::models::{ChunkId, ErasureCodec, NodeHeartbeat, NodeId, ReplicationPolicy, StoredReplica};

fn mutations() -> Vec<Mutation> {
    let chunk = ChunkId::generate();
    vec![
        Mutation::RegisterNode {
            address: "10.0.0.1:9020".into(),
            capacity: 1 << 30,
            tokens_per_node: 5,
            bucket_count: 5,
        },
        Mutation::CreateChunk {
            id: chunk,
            spec: ChunkCreateSpec {
                codec: ErasureCodec::None,
                account: "tenant".into(),
                policy: ReplicationPolicy::new(2),
                vital: true,
                consistent_placement_hash: None,
                statistics: Default::default(),
            },
        },
        Mutation::NodeHeartbeat {
            heartbeat: NodeHeartbeat {
                node: NodeId(0),
                capacity: 1 << 30,
                used_space: 1 << 20,
                inventory: vec![StoredReplica { chunk, part_index: None }],
            },
        },
        Mutation::SetUserThrottle {
            user: "tenant".into(),
            limit: Some(1024.0),
        },
    ]
}

/// Apply & log the given mutations, the way the leader does.
async fn apply_and_log(db: &Database, master: &mut ChunkMaster, mutations: Vec<Mutation>) -> Result<()> {
    for mutation in mutations {
        master.apply(mutation.clone())?;
        db.append_mutation(master.applied(), &mutation).await?;
    }
    Ok(())
}

#[tokio::test]
async fn recovery_replays_log_on_top_of_snapshot() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let mut master = ChunkMaster::default();
    let mut log = mutations();
    let tail = log.split_off(2);

    apply_and_log(&db, &mut master, log).await?;
    db.write_snapshot(&master.snapshot()).await?;
    apply_and_log(&db, &mut master, tail).await?;

    let recovered = db.recover().await?;
    assert_eq!(recovered.applied(), 4, "expected all mutations to be recovered");
    assert_eq!(
        serde_json::to_value(recovered.snapshot())?,
        serde_json::to_value(master.snapshot())?,
        "expected recovered state to match the live state"
    );
    let node = recovered.nodes().get(NodeId(0))?;
    assert_eq!(node.replicas.len(), 1, "expected heartbeat to be replayed");
    assert_eq!(recovered.throttle_overrides().get("tenant").copied(), Some(1024.0));
    Ok(())
}

#[tokio::test]
async fn recovery_of_empty_database_yields_empty_master() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config).await?;
    let recovered = db.recover().await?;
    assert_eq!(recovered.applied(), 0);
    assert!(recovered.chunks().is_empty());
    assert!(recovered.nodes().is_empty());
    Ok(())
}

#[tokio::test]
async fn recovery_rejects_gaps_in_the_log() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config).await?;
    let first = mutations().into_iter().next().context("expected a mutation")?;
    db.append_mutation(2, &first).await?;

    let res = db.recover().await;
    assert!(res.is_err(), "expected a gap in the mutation log to be fatal");
    Ok(())
}
