use std::path::Path;

use fireward::{
    config::{FirewardConfig, MachineSpec, MetadataConfig, SandboxDescriptor},
    handlers::{
        base_pipeline, Handler, HandlerPlacement, Strategy, CREATE_BOOT_SOURCE, CREATE_LOG_FILES,
        LINK_FILES, SET_METADATA, VALIDATE_CONFIG,
    },
    launch::LaunchSpec,
    server::CreateVmRequest,
    FirewardError,
};

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test]
fn test_request_becomes_launch_spec() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = config(dir.path());
    let request = CreateVmRequest {
        additional_drives: write(dir.path(), "data.ext4")? + ":ro",
        vsock_devices: vec![format!("{}:3", dir.path().join("v.sock").display())],
        metadata: MetadataConfig {
            data: "hello".into(),
        },
        debug: true,
        ..request(dir.path())?
    };

    let machine = MachineSpec::from_request(request, &config)?;
    let sandbox = SandboxDescriptor::from_config(&config.jailer, "vm-7", None);
    let spec = LaunchSpec::build(&machine, &sandbox)?;

    assert_eq!(spec.id, "vm-7");
    assert!(spec.kernel_args.ends_with("console=ttyS0"));
    assert_eq!(spec.machine_config.vcpu_count, 2);

    assert_eq!(spec.drives.len(), 2);
    assert!(spec.drives[0].is_root_device);
    assert!(!spec.drives[0].is_read_only);
    assert!(spec.drives[1].is_read_only);

    assert_eq!(spec.vsock_devices.len(), 1);
    assert_eq!(spec.vsock_devices[0].guest_cid, 3);

    let iface = &spec.network_interfaces[0];
    assert_eq!(iface.network_name, "fcnet");
    assert!(iface.if_name.starts_with("veth"));
    assert!(iface.if_name.len() <= 15);

    let args = spec.jailer.args();
    let id_at = args.iter().position(|a| a == "--id").unwrap();
    assert_eq!(args[id_at + 1], "vm-7");
    assert_eq!(args.last().map(String::as_str), Some("/run/firecracker.socket"));
    Ok(())
}

#[test_log::test]
fn test_bad_drive_is_rejected() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = config(dir.path());
    let request = CreateVmRequest {
        additional_drives: write(dir.path(), "data.ext4")?,
        ..request(dir.path())?
    };

    let machine = MachineSpec::from_request(request, &config)?;
    let sandbox = SandboxDescriptor::from_config(&config.jailer, "vm-7", None);
    let err = LaunchSpec::build(&machine, &sandbox).unwrap_err();

    assert!(matches!(err, FirewardError::MissingDriveSuffix(_)));
    assert!(err.is_client_error());
    Ok(())
}

#[test_log::test]
fn test_pipeline_with_metadata() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = config(dir.path());
    let machine = MachineSpec::from_request(request(dir.path())?, &config)?;

    let pipeline = Strategy::default_for(&machine)
        .add_requirement(HandlerPlacement::new(
            Handler::set_metadata(machine.get_metadata().clone()),
            CREATE_BOOT_SOURCE,
        ))
        .resolve(base_pipeline())?;
    let names: Vec<_> = pipeline.iter().map(Handler::name).collect();

    assert_eq!(names[0], VALIDATE_CONFIG);
    assert_eq!(names.len(), base_pipeline().len() + 2);

    let link = names.iter().position(|n| *n == LINK_FILES).unwrap();
    assert_eq!(names[link + 1], CREATE_LOG_FILES);

    let metadata = names.iter().position(|n| *n == SET_METADATA).unwrap();
    assert_eq!(names[metadata + 1], CREATE_BOOT_SOURCE);
    Ok(())
}

#[test_log::test]
fn test_unknown_anchor_fails_resolution() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = config(dir.path());
    let machine = MachineSpec::from_request(request(dir.path())?, &config)?;

    let result = Strategy::default_for(&machine)
        .add_requirement(HandlerPlacement::new(
            Handler::set_metadata(MetadataConfig::default()),
            "warm_up",
        ))
        .resolve(base_pipeline());

    assert!(matches!(result, Err(FirewardError::AnchorNotFound(anchor)) if anchor == "warm_up"));
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn config(dir: &Path) -> FirewardConfig {
    let mut config = FirewardConfig::default();
    config.jailer.chroot_base = dir.join("jail");
    config
}

fn write(dir: &Path, name: &str) -> anyhow::Result<String> {
    let path = dir.join(name);
    std::fs::write(&path, name)?;
    Ok(path.display().to_string())
}

fn request(dir: &Path) -> anyhow::Result<CreateVmRequest> {
    Ok(CreateVmRequest {
        kernel_path: write(dir, "vmlinux")?,
        root_drive_path: write(dir, "rootfs.ext4")?,
        cni_network_name: "fcnet".into(),
        vcpu_count: 2,
        mem_size_mib: 256,
        ..Default::default()
    })
}
