//! End-to-end lifecycle tests against the `local` provider.

use std::time::Duration;

use sandkit::{
    ConfigDocument, ConfigResolver, EnvSnapshot, ErrorKind, ExecOptions, ProviderRegistry,
    SandboxConfig, SandboxError, SandboxFactory, SandboxState,
};

fn factory() -> SandboxFactory {
    SandboxFactory::new(
        ProviderRegistry::with_builtins(),
        ConfigResolver::new(ConfigDocument::default(), EnvSnapshot::default()),
    )
}

fn config(base: &tempfile::TempDir) -> SandboxConfig {
    SandboxConfig::new()
        .with_timeout(Duration::from_secs(30))
        .with_provider_setting("base_dir", base.path().display().to_string())
}

#[tokio::test]
async fn test_basic_commands_and_files() {
    let base = tempfile::tempdir().unwrap();
    let factory = factory();
    let mut sandbox = factory.sandbox(None, config(&base));
    assert_eq!(sandbox.provider(), "local");

    sandbox.create().await.unwrap();
    let hello = sandbox.execute("echo 'Hello, World!'").await.unwrap();
    assert_eq!(hello.stdout, "Hello, World!\n");

    sandbox
        .upload_file("data/test.txt", b"Hello from sandkit!")
        .await
        .unwrap();
    let listing = sandbox.list_files("data").await.unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].path, "/workspace/data/test.txt");
    assert_eq!(listing[0].size, 19);

    let cat = sandbox
        .execute_with("cat test.txt", ExecOptions::new().working_dir("data"))
        .await
        .unwrap();
    assert_eq!(cat.stdout, "Hello from sandkit!");

    let failed = sandbox.execute("exit 4").await.unwrap();
    assert_eq!(failed.return_code, 4);
    let err = failed.ensure_success().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Execution);

    sandbox.terminate().await.unwrap();
}

#[tokio::test]
async fn test_snapshot_round_trip_on_fresh_sandbox() {
    let base = tempfile::tempdir().unwrap();
    let factory = factory();
    let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();

    let mut first = factory.sandbox(Some("local"), config(&base));
    first.create().await.unwrap();
    first.upload_file("blob.bin", &payload).await.unwrap();
    first.upload_file("nested/dir/notes.txt", b"keep me").await.unwrap();
    let snapshot = first.create_snapshot().await.unwrap();
    first.terminate().await.unwrap();

    let mut second = factory.sandbox(Some("local"), config(&base));
    second.create().await.unwrap();
    assert!(second.download_file("blob.bin").await.is_err());
    second.restore_snapshot(&snapshot.id).await.unwrap();

    assert_eq!(second.download_file("blob.bin").await.unwrap(), payload);
    assert_eq!(
        second.download_file("nested/dir/notes.txt").await.unwrap(),
        b"keep me"
    );
    second.terminate().await.unwrap();
}

#[tokio::test]
async fn test_restore_unknown_snapshot_is_runtime_failure() {
    let base = tempfile::tempdir().unwrap();
    let factory = factory();
    let mut sandbox = factory.sandbox(Some("local"), config(&base));
    sandbox.create().await.unwrap();

    let err = sandbox
        .restore_snapshot(&sandkit::SnapshotId::new("does-not-exist"))
        .await
        .unwrap_err();
    assert_ne!(err.kind(), ErrorKind::UnsupportedOperation);
    sandbox.terminate().await.unwrap();
}

#[tokio::test]
async fn test_terminate_twice_is_quiet() {
    let base = tempfile::tempdir().unwrap();
    let factory = factory();
    let mut sandbox = factory.sandbox(Some("local"), config(&base));
    sandbox.create().await.unwrap();
    sandbox.terminate().await.unwrap();
    sandbox.terminate().await.unwrap();
    assert_eq!(sandbox.state(), SandboxState::Terminated);

    let err = sandbox.execute("echo late").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn test_command_timeout_is_distinct() {
    let base = tempfile::tempdir().unwrap();
    let factory = factory();
    let mut sandbox = factory.sandbox(Some("local"), config(&base));
    sandbox.create().await.unwrap();

    let err = sandbox
        .execute_with("sleep 5", ExecOptions::new().timeout(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(sandbox.state(), SandboxState::Running);

    let after = sandbox.execute("echo still-alive").await.unwrap();
    assert_eq!(after.stdout.trim(), "still-alive");
    sandbox.terminate().await.unwrap();
}

#[test]
fn test_remote_provider_reports_every_missing_key() {
    let registry = ProviderRegistry::with_builtins();
    let resolver = ConfigResolver::new(ConfigDocument::default(), EnvSnapshot::default());
    let spec = registry.spec("modal").unwrap();

    match resolver.resolve(spec, SandboxConfig::default()) {
        Err(SandboxError::InvalidConfiguration { missing, problems, .. }) => {
            assert_eq!(missing, vec!["token_id", "token_secret"]);
            assert!(problems.iter().any(|p| p.contains("MODAL_TOKEN_SECRET")));
        }
        other => panic!("expected invalid configuration, got {other:?}"),
    }
}

#[test]
fn test_status_table_covers_builtins() {
    let registry = ProviderRegistry::with_builtins();
    let resolver = ConfigResolver::new(
        ConfigDocument::default(),
        EnvSnapshot::from_pairs(&[("MORPH_API_KEY", "m")]),
    );
    let statuses = registry.statuses(&resolver);
    let names: Vec<_> = statuses.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["daytona", "e2b", "local", "modal", "morph"]);

    let morph = statuses.iter().find(|s| s.name == "morph").unwrap();
    assert!(morph.configured);
    assert!(!morph.registered);
}
