//! Command line client for the fingerprint daemon: list, enroll, verify
//! and delete prints over the bus API.

mod bus;

use std::ffi::CStr;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use log::debug;

use crate::bus::{first_device, Client, Device, StatusEvent, FINGERS};

#[derive(Debug, Parser)]
#[command(name = "xfprintd-cli", version, about = "Manage fingerprints over the xfprintd bus API")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List enrolled fingerprints for the given users
    List {
        /// Users to list (defaults to the current user)
        usernames: Vec<String>,
    },
    /// Enroll a fingerprint
    Enroll {
        /// Finger to enroll
        #[arg(short, long, default_value = "right-index-finger")]
        finger: String,
        /// User to enroll (defaults to the current user)
        username: Option<String>,
    },
    /// Verify a fingerprint
    Verify {
        /// Finger to verify (default is automatic)
        #[arg(short, long, default_value = "any")]
        finger: String,
        /// User to verify (defaults to the current user)
        username: Option<String>,
    },
    /// Delete enrolled fingerprints
    Delete {
        /// Only delete this finger
        #[arg(short, long)]
        finger: Option<String>,
        /// User whose prints are deleted (defaults to the current user)
        username: Option<String>,
    },
}

fn current_username() -> String {
    let uid = unsafe { libc::geteuid() };
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let mut buf = vec![0_u8; 4096];

    let ret = unsafe {
        libc::getpwuid_r(
            uid,
            &mut pwd,
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
            &mut result,
        )
    };
    if ret != 0 || result.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(pwd.pw_name) }
        .to_string_lossy()
        .into_owned()
}

fn check_finger_name(name: &str) -> Result<(), ()> {
    if name == "any" || FINGERS.contains(&name) {
        return Ok(());
    }
    println!(
        "Invalid finger name '{}'. Name must be one of {}",
        name,
        FINGERS.join(", ")
    );
    Err(())
}

async fn default_device(client: &Client) -> Result<Device, ()> {
    match first_device(client).await {
        Ok(Some(device)) => {
            println!("Using device {}", device.object_path());
            Ok(device)
        }
        Ok(None) => {
            println!("No devices available");
            Err(())
        }
        Err(err) => {
            println!("Impossible to get devices: {err}");
            Err(())
        }
    }
}

async fn connect() -> Result<Client, ()> {
    match Client::system().await {
        Ok(client) => Ok(client),
        Err(err) => {
            println!("Failed to connect to system bus: {err}");
            Err(())
        }
    }
}

async fn do_list(usernames: Vec<String>) -> Result<(), ()> {
    let client = connect().await?;
    let manager = client.manager();

    let paths = match manager.get_devices().await {
        Ok(paths) => paths,
        Err(err) => {
            println!("Impossible to get devices: {err}");
            return Err(());
        }
    };
    if paths.is_empty() {
        println!("No devices available");
        return Err(());
    }
    println!("found {} devices", paths.len());
    for path in &paths {
        println!("Device at {}", path.as_str());
    }

    let usernames = if usernames.is_empty() {
        vec![current_username()]
    } else {
        usernames
    };

    for path in paths {
        let device = client.device(path);
        let name = device.name().await.unwrap_or_else(|_| "unknown".to_string());
        let scan_type = device
            .scan_type()
            .await
            .unwrap_or_else(|_| "unknown".to_string());

        for username in &usernames {
            match device.list_enrolled_fingers(username).await {
                Ok(fingers) => {
                    println!("Fingerprints for user {username} on {name} ({scan_type}):");
                    for (i, finger) in fingers.iter().enumerate() {
                        println!(" - #{i}: {finger}");
                    }
                }
                Err(err) => {
                    debug!("ListEnrolledFingers failed: {err}");
                    println!("User {username} has no fingers enrolled for {name}.");
                }
            }
        }
    }

    Ok(())
}

async fn do_enroll(finger: String, username: Option<String>) -> Result<(), ()> {
    check_finger_name(&finger)?;
    let client = connect().await?;
    let device = default_device(&client).await?;
    let username = username.unwrap_or_default();

    if let Err(err) = device.claim(&username).await {
        println!("failed to claim device: {err}");
        return Err(());
    }

    let result = drive_enroll(&device, &finger).await;

    if let Err(err) = device.release().await {
        println!("ReleaseDevice failed: {err}");
        return Err(());
    }

    result.map(|_| ())
}

async fn drive_enroll(device: &Device, finger: &str) -> Result<bool, ()> {
    let proxy = match device.proxy().await {
        Ok(proxy) => proxy,
        Err(err) => {
            println!("failed to connect to device: {err}");
            return Err(());
        }
    };
    let mut status = match proxy.receive_signal("EnrollStatus").await {
        Ok(stream) => stream,
        Err(err) => {
            println!("failed to connect to device: {err}");
            return Err(());
        }
    };

    println!("Enrolling {finger} finger.");
    if let Err(err) = device.enroll_start(finger).await {
        println!("EnrollStart failed: {err}");
        return Err(());
    }

    let mut enrolled = false;
    while let Some(msg) = status.next().await {
        let Ok((result, done)) = msg.body().deserialize::<(String, bool)>() else {
            continue;
        };
        let event = StatusEvent { result, done };
        println!("Enroll result: {}", event.result);
        if event.done {
            enrolled = event.result == "enroll-completed";
            break;
        }
    }

    if let Err(err) = device.enroll_stop().await {
        println!("EnrollStop failed: {err}");
        return Err(());
    }

    Ok(enrolled)
}

async fn do_verify(finger: String, username: Option<String>) -> Result<bool, ()> {
    check_finger_name(&finger)?;
    let client = connect().await?;
    let device = default_device(&client).await?;
    let username = username.unwrap_or_default();

    if let Err(err) = device.claim(&username).await {
        println!("failed to claim device: {err}");
        return Err(());
    }

    match device.list_enrolled_fingers(&username).await {
        Ok(fingers) => {
            println!("Listing enrolled fingers:");
            for (i, name) in fingers.iter().enumerate() {
                println!(" - #{i}: {name}");
            }
            if finger != "any" && !fingers.contains(&finger) {
                println!("Finger '{finger}' not enrolled.");
                let _ = device.release().await;
                return Err(());
            }
        }
        Err(err) => {
            println!("ListEnrolledFingers failed: {err}");
            let _ = device.release().await;
            return Err(());
        }
    }

    let result = drive_verify(&device, &finger).await;

    if let Err(err) = device.release().await {
        println!("ReleaseDevice failed: {err}");
        return Err(());
    }

    result
}

async fn drive_verify(device: &Device, finger: &str) -> Result<bool, ()> {
    let proxy = match device.proxy().await {
        Ok(proxy) => proxy,
        Err(err) => {
            println!("failed to connect to device: {err}");
            return Err(());
        }
    };

    // Subscribe before starting: VerifyFingerSelected arrives before the
    // VerifyStart reply.
    let mut selected = match proxy.receive_signal("VerifyFingerSelected").await {
        Ok(stream) => stream,
        Err(err) => {
            println!("failed to connect to device: {err}");
            return Err(());
        }
    };
    let mut status = match proxy.receive_signal("VerifyStatus").await {
        Ok(stream) => stream,
        Err(err) => {
            println!("failed to connect to device: {err}");
            return Err(());
        }
    };

    if let Err(err) = device.verify_start(finger).await {
        println!("VerifyStart failed: {err}");
        return Err(());
    }
    println!("Verify started!");

    let mut matched = false;
    loop {
        tokio::select! {
            msg = selected.next() => {
                let Some(msg) = msg else { break };
                if let Ok((name,)) = msg.body().deserialize::<(String,)>() {
                    println!("Verifying: {name}");
                }
            }
            msg = status.next() => {
                let Some(msg) = msg else { break };
                let Ok((result, done)) = msg.body().deserialize::<(String, bool)>() else {
                    continue;
                };
                println!("Verify result: {result} ({})", if done { "done" } else { "not done" });
                if done {
                    matched = result == "verify-match";
                    break;
                }
            }
        }
    }

    if let Err(err) = device.verify_stop().await {
        println!("VerifyStop failed: {err}");
        return Err(());
    }

    Ok(matched)
}

async fn do_delete(finger: Option<String>, username: Option<String>) -> Result<(), ()> {
    if let Some(finger) = &finger {
        check_finger_name(finger)?;
        if finger == "any" {
            println!("Invalid finger name 'any' for delete");
            return Err(());
        }
    }

    let client = connect().await?;
    let device = default_device(&client).await?;
    let username = username.unwrap_or_else(current_username);

    if let Err(err) = device.claim(&username).await {
        println!("failed to claim device: {err}");
        return Err(());
    }

    let name = device.name().await.unwrap_or_else(|_| "unknown".to_string());
    let result = match &finger {
        Some(finger) => device.delete_enrolled_finger(finger).await,
        None => device.delete_enrolled_fingers().await,
    };

    let outcome = match result {
        Ok(()) => {
            match &finger {
                Some(finger) => {
                    println!("Fingerprint {finger} of user {username} deleted on {name}")
                }
                None => println!("Fingerprints of user {username} deleted on {name}"),
            }
            Ok(())
        }
        Err(err) => {
            println!("Failed to delete fingerprints: {err}");
            Err(())
        }
    };

    if let Err(err) = device.release().await {
        println!("ReleaseDevice failed: {err}");
        return Err(());
    }

    outcome
}

#[tokio::main]
async fn main() -> ExitCode {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Warn)
        .init()
        .expect("logger installed twice");

    let cli = Cli::parse();
    let outcome = match cli.cmd {
        Command::List { usernames } => do_list(usernames).await,
        Command::Enroll { finger, username } => do_enroll(finger, username).await,
        Command::Verify { finger, username } => do_verify(finger, username)
            .await
            .and_then(|matched| if matched { Ok(()) } else { Err(()) }),
        Command::Delete { finger, username } => do_delete(finger, username).await,
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(()) => ExitCode::FAILURE,
    }
}
