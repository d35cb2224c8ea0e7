//! Integration tests for the volume lifecycle against the in-memory backend.
//!
//! Every test builds its own region state, applies a catalog through the
//! public API and inspects the recorded EC2 calls.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};

use ebsvol::ec2::memory::{MemoryEc2Factory, Operation};
use ebsvol::fetch::instances;
use ebsvol::model::{AttachmentDescriptor, RemoteVolume, STATE_AVAILABLE, STATE_IN_USE, Snapshot, Tag};
use ebsvol::{Applier, AttachSpec, Catalog, Change, Ensure, ProviderConfig, VolumeResource};

fn config() -> ProviderConfig {
    ProviderConfig::default()
        .with_retry(3, Duration::from_millis(1), Duration::from_millis(5))
        .unwrap()
}

fn attached_volume(name: &str) -> VolumeResource {
    VolumeResource {
        availability_zone: Some("eu-west-1a".into()),
        size: Some(20),
        volume_type: Some("gp3".into()),
        attach: Some(AttachSpec {
            instance_id: "i-0abc".into(),
            device: "/dev/sdf".into(),
            delete_on_termination: None,
        }),
        ..VolumeResource::new(name, "eu-west-1")
    }
}

fn position(ops: &[Operation], op: Operation) -> usize {
    ops.iter()
        .position(|o| *o == op)
        .unwrap_or_else(|| panic!("{op} was never called: {ops:?}"))
}

#[tokio::test]
async fn test_list_spans_regions() {
    let factory = MemoryEc2Factory::new();
    factory
        .region("us-east-1")
        .await
        .add_volume(RemoteVolume {
            volume_id: "vol-east".into(),
            state: STATE_IN_USE.into(),
            tags: vec![Tag::new("Name", "east")],
            ..Default::default()
        })
        .await;
    let west = factory.region("eu-west-1").await;
    west.add_volume(RemoteVolume {
        volume_id: "vol-west".into(),
        state: STATE_AVAILABLE.into(),
        tags: vec![Tag::new("Name", "west")],
        ..Default::default()
    })
    .await;
    // unnamed volumes are not listed
    west.add_volume(RemoteVolume {
        volume_id: "vol-anon".into(),
        state: STATE_AVAILABLE.into(),
        ..Default::default()
    })
    .await;

    let regions = vec!["us-east-1".to_string(), "eu-west-1".to_string()];
    let volumes = instances(&factory, &regions).await.unwrap();

    assert_eq!(volumes.len(), 2);
    let east = volumes.iter().find(|v| v.name == "east").unwrap();
    assert_eq!(east.region, "us-east-1");
    assert_eq!(east.ensure, Ensure::Present);
    let west = volumes.iter().find(|v| v.name == "west").unwrap();
    assert_eq!(west.region, "eu-west-1");
    assert_eq!(west.ensure, Ensure::Absent);
}

#[tokio::test]
async fn test_create_attach_then_destroy() {
    let factory = Arc::new(MemoryEc2Factory::new());
    let applier = Applier::new(factory.clone(), config());

    let mut catalog = Catalog {
        volumes: vec![attached_volume("db-data")],
    };
    let report = applier.apply(&catalog).await.unwrap();
    assert!(report.is_success());
    let outcome = report.outcome("db-data").unwrap();
    assert_eq!(outcome.change, Change::Created);
    let volume_id = outcome.volume_id.clone().unwrap();

    let region = factory.region("eu-west-1").await;
    let volume = region.volume(&volume_id).await.unwrap();
    assert_eq!(volume.state, STATE_IN_USE);
    assert_eq!(volume.attachments[0].instance_id, "i-0abc");
    assert!(volume.tags.contains(&Tag::new("Name", "db-data")));

    let ops = region.operations().await;
    assert!(position(&ops, Operation::CreateVolume) < position(&ops, Operation::CreateTags));
    assert!(position(&ops, Operation::CreateTags) < position(&ops, Operation::AttachVolume));

    // rerun is a no-op
    let report = applier.apply(&catalog).await.unwrap();
    assert_eq!(report.outcome("db-data").unwrap().change, Change::Unchanged);

    catalog.volumes[0].ensure = Ensure::Absent;
    let report = applier.apply(&catalog).await.unwrap();
    assert_eq!(report.outcome("db-data").unwrap().change, Change::Destroyed);
    assert!(region.volume(&volume_id).await.is_none());

    let ops = region.operations().await;
    assert!(position(&ops, Operation::DetachVolume) < position(&ops, Operation::DeleteVolume));
}

#[tokio::test]
async fn test_available_volume_gets_attached() {
    let factory = Arc::new(MemoryEc2Factory::new());
    let region = factory.region("eu-west-1").await;
    region
        .add_volume(RemoteVolume {
            volume_id: "vol-spare".into(),
            size: Some(20),
            state: STATE_AVAILABLE.into(),
            tags: vec![Tag::new("Name", "spare")],
            ..Default::default()
        })
        .await;

    let report = Applier::new(factory.clone(), config())
        .apply(&Catalog {
            volumes: vec![attached_volume("spare")],
        })
        .await
        .unwrap();

    let outcome = report.outcome("spare").unwrap();
    assert_eq!(outcome.change, Change::Attached);
    assert_eq!(outcome.volume_id.as_deref(), Some("vol-spare"));
    assert!(!region.operations().await.contains(&Operation::CreateVolume));
    assert_eq!(
        region.volume("vol-spare").await.unwrap().attachments,
        vec![AttachmentDescriptor {
            instance_id: "i-0abc".into(),
            device: "/dev/sdf".into(),
            delete_on_termination: false,
        }]
    );
}

#[tokio::test]
async fn test_restore_from_latest_snapshot() {
    let factory = Arc::new(MemoryEc2Factory::new());
    let region = factory.region("eu-west-1").await;
    for (id, day, state) in [
        ("snap-old", 1, "completed"),
        ("snap-new", 3, "completed"),
        ("snap-pending", 5, "pending"),
    ] {
        region
            .add_snapshot(Snapshot {
                snapshot_id: id.into(),
                description: "nightly-db".into(),
                state: state.into(),
                start_time: Utc.with_ymd_and_hms(2026, 3, day, 0, 0, 0).unwrap(),
            })
            .await;
    }

    let resource = VolumeResource {
        size: None,
        snapshot_label: Some("nightly-db".into()),
        attach: None,
        ..attached_volume("restored")
    };
    let report = Applier::new(factory.clone(), config())
        .apply(&Catalog {
            volumes: vec![resource],
        })
        .await
        .unwrap();

    let volume_id = report.outcome("restored").unwrap().volume_id.clone().unwrap();
    let volume = region.volume(&volume_id).await.unwrap();
    assert_eq!(volume.snapshot_id.as_deref(), Some("snap-new"));
}

#[tokio::test]
async fn test_throttled_create_is_retried() {
    let factory = Arc::new(MemoryEc2Factory::new());
    let region = factory.region("eu-west-1").await;
    region
        .fail_next(Operation::CreateVolume, "RequestLimitExceeded", 2)
        .await;

    let report = Applier::new(factory.clone(), config())
        .apply(&Catalog {
            volumes: vec![attached_volume("busy")],
        })
        .await
        .unwrap();

    assert_eq!(report.outcome("busy").unwrap().change, Change::Created);
    assert_eq!(region.state().await.volumes.len(), 1);
}

#[tokio::test]
async fn test_catalog_file_and_state_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let catalog_path = dir.path().join("catalog.json");
    let state_path = dir.path().join("state.json");
    tokio::fs::write(
        &catalog_path,
        r#"{"volumes":[{"name":"logs","region":"us-east-1","availability_zone":"us-east-1b","size":5}]}"#,
    )
    .await
    .unwrap();

    let catalog = Catalog::load(&catalog_path).await.unwrap();
    let factory = Arc::new(MemoryEc2Factory::load(&state_path).await.unwrap());
    Applier::new(factory.clone(), config())
        .apply(&catalog)
        .await
        .unwrap();
    factory.save(&state_path).await.unwrap();

    let reloaded = MemoryEc2Factory::load(&state_path).await.unwrap();
    let volumes = instances(&reloaded, &["us-east-1".to_string()])
        .await
        .unwrap();
    assert_eq!(volumes.len(), 1);
    assert_eq!(volumes[0].name, "logs");
    assert_eq!(volumes[0].availability_zone.as_deref(), Some("us-east-1b"));
}
