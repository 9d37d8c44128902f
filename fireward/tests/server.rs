use std::{path::Path, sync::Arc};

use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::Response,
    Router,
};
use fireward::{
    config::FirewardConfig,
    management::VmmManager,
    network::CniRuntime,
    runtime::{Arch, JailerBackend},
    server::{create_router, CreateVmRequest, ErrorResponse, ServerState},
};
use http_body_util::BodyExt;
use tower::ServiceExt;

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_create_with_missing_kernel_is_unprocessable() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let rootfs = dir.path().join("rootfs.ext4");
    std::fs::write(&rootfs, b"rootfs")?;

    let request = CreateVmRequest {
        kernel_path: dir.path().join("vmlinux").display().to_string(),
        root_drive_path: rootfs.display().to_string(),
        cni_network_name: "fcnet".into(),
        vcpu_count: 1,
        mem_size_mib: 128,
        ..Default::default()
    };

    let response = app(dir.path())
        .oneshot(post("/create", serde_json::to_string(&request)?))
        .await?;

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let error: ErrorResponse = serde_json::from_str(&body_of(response).await?)?;
    assert!(error.error.contains("vmlinux"));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_stop_removes_stale_sandbox() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let instance_dir = dir.path().join("jail/firecracker/stale-vm");
    std::fs::create_dir_all(instance_dir.join("root/run"))?;

    let stop = serde_json::json!({ "vmmId": "stale-vm", "pid": 4321, "arch": "x86_64" });
    let response = app(dir.path()).oneshot(post("/stop", stop.to_string())).await?;

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        body_of(response).await?,
        "VM with id: stale-vm has been stopped\n"
    );
    assert!(!instance_dir.exists());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_stop_honors_chroot_base_override() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let other_base = dir.path().join("elsewhere");
    let instance_dir = other_base.join("firecracker/vm-2");
    std::fs::create_dir_all(&instance_dir)?;

    let stop = serde_json::json!({
        "vmmId": "vm-2",
        "pid": 4321,
        "arch": "x86_64",
        "jailerChrootBase": other_base.display().to_string(),
    });
    let response = app(dir.path()).oneshot(post("/stop", stop.to_string())).await?;

    assert_eq!(response.status(), StatusCode::CREATED);
    assert!(!instance_dir.exists());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_unknown_route() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let response = app(dir.path())
        .oneshot(Request::get("/nowhere").body(Body::empty())?)
        .await?;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn app(dir: &Path) -> Router {
    let mut config = FirewardConfig::default();
    config.jailer.chroot_base = dir.join("jail");
    config.jailer.firecracker_binary = "/usr/bin/firecracker".into();

    let backend = JailerBackend::new(CniRuntime::new(config.cni.clone()), Arch::X86_64);
    create_router(ServerState::new(VmmManager::with_backend(
        config,
        Arc::new(backend),
    )))
}

fn post(uri: &str, body: String) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .expect("valid request")
}

async fn body_of(response: Response) -> anyhow::Result<String> {
    let bytes = response.into_body().collect().await?.to_bytes();
    Ok(String::from_utf8(bytes.to_vec())?)
}
