use std::ffi::OsString;
use std::path::{Path, PathBuf};

use facet_value::{VArray, Value, value};

use crate::error::{Result, VmforkError};
use crate::process;

/// Where the first-boot script lands inside the guest.
const SCRIPT_PATH: &str = "/var/lib/vmfork/provision.sh";

/// Inputs for a NoCloud seed.
pub struct Seed<'a> {
    pub instance_id: &'a str,
    pub user: &'a str,
    pub ssh_keys: &'a [String],
    pub packages: &'a [String],
    pub script: &'a str,
}

/// Write a cloud-init NoCloud seed ISO (volume label `cidata`) into `dir`
/// and return its path.
pub async fn write_seed(dir: &Path, seed: &Seed<'_>) -> Result<PathBuf> {
    let staging = dir.join("seed");
    tokio::fs::create_dir_all(&staging)
        .await
        .map_err(|e| VmforkError::io(format!("creating directory {}", staging.display()), e))?;

    let id = seed.instance_id;
    let files = [
        (
            "meta-data",
            format!("instance-id: {id}\nlocal-hostname: {id}\n"),
        ),
        ("user-data", build_user_data(seed)?),
        (
            "network-config",
            "version: 2\nethernets:\n  id0:\n    match:\n      name: \"e*\"\n    dhcp4: true\n"
                .to_string(),
        ),
    ];
    for (name, contents) in &files {
        let path = staging.join(name);
        tokio::fs::write(&path, contents)
            .await
            .map_err(|e| VmforkError::io(format!("writing {}", path.display()), e))?;
    }

    let iso = dir.join("seed.iso");
    let _ = tokio::fs::remove_file(&iso).await;
    let tool = iso_tool().ok_or_else(|| VmforkError::ToolFailed {
        tool: "iso authoring".into(),
        status: "missing".into(),
        stderr: "none of hdiutil, genisoimage, mkisofs, xorriso or oscdimg was found".into(),
    })?;
    let args = iso_args(tool, &staging, &iso);
    process::run(tool, &args).await?;

    let _ = tokio::fs::remove_dir_all(&staging).await;
    tracing::info!(path = %iso.display(), "generated cloud-init seed ISO");
    Ok(iso)
}

fn iso_tool() -> Option<&'static str> {
    let candidates: &[&str] = if cfg!(target_os = "macos") {
        &["hdiutil"]
    } else if cfg!(windows) {
        &["oscdimg"]
    } else {
        &["genisoimage", "mkisofs", "xorriso"]
    };
    candidates
        .iter()
        .copied()
        .find(|t| process::which(t).is_some())
}

fn iso_args(tool: &str, staging: &Path, iso: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();
    match tool {
        "hdiutil" => {
            args.extend(["makehybrid", "-o"].map(OsString::from));
            args.push(iso.into());
            args.extend(["-iso", "-joliet", "-default-volume-name", "cidata"].map(OsString::from));
            args.push(staging.into());
        }
        "oscdimg" => {
            args.extend(["-j1", "-lcidata"].map(OsString::from));
            args.push(staging.into());
            args.push(iso.into());
        }
        _ => {
            if tool == "xorriso" {
                args.extend(["-as", "mkisofs"].map(OsString::from));
            }
            args.push("-output".into());
            args.push(iso.into());
            args.extend(["-volid", "cidata", "-joliet", "-rock"].map(OsString::from));
            args.push(staging.into());
        }
    }
    args
}

fn build_user_data(seed: &Seed<'_>) -> Result<String> {
    let mut user = value!({
        "name": (seed.user),
        "shell": "/bin/bash",
        "sudo": "ALL=(ALL) NOPASSWD:ALL",
        "lock_passwd": true,
    });
    if !seed.ssh_keys.is_empty()
        && let Some(obj) = user.as_object_mut()
    {
        let keys = VArray::from_iter(seed.ssh_keys.iter().map(|k| Value::from(k.as_str())));
        obj.insert("ssh_authorized_keys", Value::from(keys));
    }

    let mut config = value!({
        "users": [user],
        "package_update": (!seed.packages.is_empty()),
    });
    let Some(obj) = config.as_object_mut() else {
        return Err(VmforkError::Validation {
            message: "cloud-config root is not a mapping".into(),
        });
    };

    if !seed.packages.is_empty() {
        let packages = VArray::from_iter(seed.packages.iter().map(|p| Value::from(p.as_str())));
        obj.insert("packages", Value::from(packages));
    }

    if !seed.script.trim().is_empty() {
        let mut write_files = VArray::new();
        write_files.push(value!({
            "path": (SCRIPT_PATH),
            "permissions": "0755",
            "content": (seed.script),
        }));
        obj.insert("write_files", Value::from(write_files));

        let mut runcmd = VArray::new();
        runcmd.push(value!([(SCRIPT_PATH)]));
        obj.insert("runcmd", Value::from(runcmd));
    }

    let yaml = facet_yaml::to_string(&config).map_err(|e| VmforkError::Validation {
        message: format!("rendering cloud-config: {e}"),
    })?;
    // cloud-init wants #cloud-config as the very first line.
    let yaml = yaml.strip_prefix("---\n").unwrap_or(&yaml);
    Ok(format!("#cloud-config\n{yaml}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed<'a>(keys: &'a [String], packages: &'a [String], script: &'a str) -> Seed<'a> {
        Seed {
            instance_id: "web",
            user: "agent",
            ssh_keys: keys,
            packages,
            script,
        }
    }

    #[test]
    fn user_data_has_user_and_key() {
        let keys = vec!["ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAITest vmfork".to_string()];
        let ud = build_user_data(&seed(&keys, &[], "")).unwrap();
        assert!(ud.starts_with("#cloud-config\n"));
        assert!(ud.contains("name: agent"));
        assert!(ud.contains("ssh_authorized_keys:"));
        assert!(ud.contains("AAAAC3NzaC1lZDI1NTE5AAAAITest vmfork"));
        assert!(!ud.contains("runcmd"));
    }

    #[test]
    fn user_data_runs_provision_script() {
        let packages = vec!["postgresql".to_string(), "redis-server".to_string()];
        let ud = build_user_data(&seed(&[], &packages, "echo ready\n")).unwrap();
        assert!(ud.contains("packages:"));
        assert!(ud.contains("redis-server"));
        assert!(ud.contains(SCRIPT_PATH));
        assert!(ud.contains("runcmd:"));
        assert!(ud.contains("echo ready"));
    }

    #[test]
    fn iso_args_per_tool() {
        let staging = Path::new("/vms/web/seed");
        let iso = Path::new("/vms/web/seed.iso");

        let args = iso_args("genisoimage", staging, iso);
        assert_eq!(args[0], "-output");
        assert!(args.contains(&OsString::from("cidata")));
        assert_eq!(args.last().unwrap(), "/vms/web/seed");

        let args = iso_args("xorriso", staging, iso);
        assert_eq!(&args[..2], &[OsString::from("-as"), OsString::from("mkisofs")]);

        let args = iso_args("hdiutil", staging, iso);
        assert_eq!(args[0], "makehybrid");
        assert!(args.contains(&OsString::from("-default-volume-name")));

        let args = iso_args("oscdimg", staging, iso);
        assert_eq!(args[1], "-lcidata");
        assert_eq!(args.last().unwrap(), "/vms/web/seed.iso");
    }
}
