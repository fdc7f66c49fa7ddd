mod backend;
mod context;
mod device;
mod error;
mod escalate;
mod fs;
mod handle_table;
mod logging;
mod passthrough;
mod util;

use anyhow::Context;
use backend::smooth::RampConfig;
use backend::{AliasBackend, Backend, SmoothBackend};
use clap::{Args, Parser, Subcommand, ValueEnum};
use context::MountContext;
use escalate::InterruptSelf;
use fs::BacklightFs;
use fuse3::MountOptions;
use fuse3::path::Session;
use futures_util::future::poll_fn;
use passthrough::Passthrough;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::oneshot;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "backlightfs")]
#[command(about = "FUSE overlay for sysfs backlight directories with aliased or smoothed brightness")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Mirror brightness writes onto a second backlight, rescaled to its range.
    Alias {
        /// Backlight directory to overlay.
        dir: PathBuf,

        /// Backlight directory that receives the rescaled writes.
        target: PathBuf,

        #[command(flatten)]
        mount: MountArgs,
    },

    /// Ease the device towards written values instead of jumping.
    Smooth {
        /// Backlight directory to overlay.
        dir: PathBuf,

        /// Time for a sweep across the full range, in milliseconds.
        #[arg(long, default_value_t = 1000)]
        full_scale_ms: u64,

        /// Shortest delay between two device writes, in milliseconds.
        #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
        min_interval_ms: u64,

        /// Shortest duration of any ramp, in milliseconds.
        #[arg(long, default_value_t = 1000)]
        min_period_ms: u64,

        /// Where the smoothing worker runs.
        #[arg(long, value_enum, default_value_t = WorkerMode::Process)]
        worker: WorkerMode,

        #[command(flatten)]
        mount: MountArgs,
    },
}

#[derive(Args, Debug)]
struct MountArgs {
    /// Mount point. Defaults to the overlaid directory itself.
    #[arg(long)]
    mountpoint: Option<PathBuf>,

    /// Allow other users to access the mount (passes allow_other to FUSE).
    #[arg(long, default_value_t = false)]
    allow_other: bool,

    /// Permit mounting on a non-empty directory. Always on when overlaying
    /// the backlight directory itself.
    #[arg(long, default_value_t = false)]
    nonempty: bool,

    /// Let the kernel enforce file permissions.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    default_permissions: bool,
}

impl MountArgs {
    /// Mount point and whether it may be non-empty. Without `--mountpoint`
    /// the mount covers `dir`, which always holds the device files.
    fn resolve(&self, dir: PathBuf) -> (PathBuf, bool) {
        match &self.mountpoint {
            Some(mountpoint) => (mountpoint.clone(), self.nonempty),
            None => (dir, true),
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum WorkerMode {
    /// Forked child process.
    Process,
    /// Thread inside the filesystem process.
    Thread,
}

/// Everything needed to mount, resolved before the runtime starts.
struct Mount {
    fs_name: &'static str,
    mountpoint: PathBuf,
    nonempty: bool,
    args: MountArgs,
    passthrough: Passthrough,
}

fn prepare(command: Command) -> anyhow::Result<Mount> {
    match command {
        Command::Alias { dir, target, mount } => {
            let ctx = MountContext::open(dir.clone())?;
            let backend = AliasBackend::open(&target, ctx.max_brightness())
                .with_context(|| format!("alias target {}", target.display()))?;
            info!(
                dir = %dir.display(),
                target = %target.display(),
                "aliasing brightness"
            );
            Ok(Mount::new("backlightfs-alias", dir, mount, ctx, Box::new(backend)))
        }
        Command::Smooth {
            dir,
            full_scale_ms,
            min_interval_ms,
            min_period_ms,
            worker,
            mount,
        } => {
            let ctx = MountContext::open(dir.clone())?;
            let config = RampConfig {
                full_scale: Duration::from_millis(full_scale_ms),
                min_interval: Duration::from_millis(min_interval_ms),
                min_period: Duration::from_millis(min_period_ms),
            };
            let backend = match worker {
                WorkerMode::Process => SmoothBackend::spawn_process(ctx.dir(), config),
                WorkerMode::Thread => {
                    SmoothBackend::spawn_thread(ctx.dir(), config, Arc::new(InterruptSelf))
                }
            }
            .with_context(|| format!("smoothing {}", dir.display()))?;
            info!(dir = %dir.display(), ?worker, "smoothing brightness");
            Ok(Mount::new("backlightfs-smooth", dir, mount, ctx, Box::new(backend)))
        }
    }
}

impl Mount {
    fn new(
        fs_name: &'static str,
        dir: PathBuf,
        args: MountArgs,
        ctx: MountContext,
        backend: Box<dyn Backend>,
    ) -> Self {
        let (mountpoint, nonempty) = args.resolve(dir);
        Self {
            fs_name,
            mountpoint,
            nonempty,
            args,
            passthrough: Passthrough::new(ctx, backend, Arc::new(InterruptSelf)),
        }
    }
}

fn main() -> anyhow::Result<()> {
    logging::init_logging();
    let cli = Cli::parse();

    // A process worker is forked here, while this is still the only thread.
    let mount = prepare(cli.command)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(mount))
}

async fn serve(mount: Mount) -> anyhow::Result<()> {
    let mut mount_opts = MountOptions::default();
    mount_opts.fs_name(mount.fs_name);
    mount_opts.allow_other(mount.args.allow_other);
    mount_opts.nonempty(mount.nonempty);
    mount_opts.default_permissions(mount.args.default_permissions);

    let mountpoint = mount.mountpoint;
    let fs = BacklightFs::new(mount.passthrough);

    let session = Session::new(mount_opts);
    let handle = session
        .mount(fs, &mountpoint)
        .await
        .with_context(|| format!("cannot mount on {}", mountpoint.display()))?;
    info!(mountpoint = %mountpoint.display(), "mounted");

    // Listen for termination signals and unmount cleanly before exiting.
    let (unmount_tx, unmount_rx) = oneshot::channel::<()>();

    let mut mount_task = tokio::spawn(async move {
        let mut handle = Some(handle);
        let mut handle_future = poll_fn(|cx| match handle.as_mut() {
            Some(handle) => Pin::new(handle).poll(cx),
            None => std::task::Poll::Ready(Ok(())),
        });

        let res = tokio::select! {
            res = &mut handle_future => res,
            _ = unmount_rx => match handle.take() {
                Some(handle) => handle.unmount().await,
                None => Ok(()),
            },
        };

        res.map_err(anyhow::Error::from)
    });

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let signals = async {
        tokio::select! {
            _ = sigint.recv() => (),
            _ = sigterm.recv() => (),
        }
    };
    tokio::pin!(signals);

    let result = tokio::select! {
        res = &mut mount_task => res,
        _ = &mut signals => {
            info!("termination requested, unmounting");
            let _ = unmount_tx.send(());
            mount_task.await
        }
    };

    result??;
    info!(mountpoint = %mountpoint.display(), "unmounted");
    Ok(())
}
