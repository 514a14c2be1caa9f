use std::path::PathBuf;

use ::fuse::mount;
use log::debug;
use pretty_env_logger;
use structopt::StructOpt;

use sealfs::{Enclave, EnclaveMounter, SealFsFuse};

/// Mount a sealed in-memory file system using FUSE.
///
/// The dump root holds the sealed blocks between mounts; it is read at
/// mount and rewritten at unmount. The sealing key is derived from the
/// password and the dump root's name.
#[derive(Debug, StructOpt)]
#[structopt(name = "fuse-sealfs", about = "mount a sealed in-memory file system using fuse")]
struct Opt {
    /// Host directory holding the sealed dump
    #[structopt(parse(from_os_str))]
    dump_root: PathBuf,
    /// Mount point
    #[structopt(parse(from_os_str))]
    mount_path: PathBuf,
    /// Sealing password; prompted for when not given
    #[structopt(short = "p", long = "password")]
    password: Option<String>,
    /// Block size for file contents
    #[structopt(short = "s", long = "block-size", default_value = "4096")]
    block_size: usize,
}

fn main() -> Result<(), failure::Error> {
    pretty_env_logger::init();

    let opt = Opt::from_args();
    debug!("running with options {:?}", opt);

    let password = match opt.password {
        Some(password) => password,
        None => rpassword::read_password_from_tty(Some("sealing password: "))?,
    };

    let enclave = Enclave::mount(&opt.dump_root, &password, opt.block_size)?;
    let mounter = EnclaveMounter::new(enclave);
    let fs = SealFsFuse::new(mounter);

    // Returns when the kernel unmounts us; the dump happens in `destroy`.
    mount(fs, &opt.mount_path, &[])?;

    Ok(())
}
