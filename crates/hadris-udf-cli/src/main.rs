use std::fs::OpenOptions;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use hadris_udf::device::BlockDevice;
use hadris_udf::error::UdfError;
use hadris_udf::instance::FeLocation;
use hadris_udf::ops;
use hadris_udf::{FormatOptions, MountOptions, Volume};
use hadris_io::{Read, Seek, Write};

const DEFAULT_BLOCK_SIZE: u32 = 2048;

#[derive(Parser)]
#[command(author, version, about = "Universal Disk Format image utility")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new, empty UDF image.
    Format(FormatArgs),
    /// List the root directory of an existing UDF image.
    Ls(LsArgs),
    /// Print the bytes of a root-level file.
    Cat(CatArgs),
    /// Write a host file into the image's root directory.
    Put(PutArgs),
}

impl Command {
    fn verbose(&self) -> bool {
        match self {
            Command::Format(args) => args.verbose,
            Command::Ls(args) => args.verbose,
            Command::Cat(args) => args.verbose,
            Command::Put(args) => args.verbose,
        }
    }
}

#[derive(Parser)]
struct FormatArgs {
    /// Output image path; created if missing.
    output: PathBuf,

    /// Image size in bytes.
    #[arg(long, default_value_t = 64 * 1024 * 1024)]
    size: u64,

    /// Volume identifier written into the Primary/Logical Volume Descriptors.
    #[arg(long, default_value = "hadris-udf")]
    label: String,

    #[arg(short, long)]
    verbose: bool,
}

#[derive(Parser)]
struct LsArgs {
    /// Image to read.
    input: PathBuf,

    #[arg(short, long)]
    verbose: bool,
}

#[derive(Parser)]
struct CatArgs {
    /// Image to read.
    input: PathBuf,
    /// Root-level file name.
    name: String,

    #[arg(short, long)]
    verbose: bool,
}

#[derive(Parser)]
struct PutArgs {
    /// Image to modify.
    image: PathBuf,
    /// Host file to copy in.
    source: PathBuf,
    /// Name to give the file in the image's root directory; defaults to
    /// `source`'s file name.
    #[arg(long)]
    name: Option<String>,

    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();
    simple_logger::SimpleLogger::new()
        .with_level(if args.cmd.verbose() {
            log::LevelFilter::Trace
        } else {
            log::LevelFilter::Warn
        })
        .init()
        .unwrap();

    let result = match args.cmd {
        Command::Format(a) => format(a),
        Command::Ls(a) => ls(a),
        Command::Cat(a) => cat(a),
        Command::Put(a) => put(a),
    };

    if let Err(err) = result {
        log::error!("{err}");
        std::process::exit(1);
    }
}

fn format(args: FormatArgs) -> Result<(), UdfError> {
    let sector_count = args.size / DEFAULT_BLOCK_SIZE as u64;
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&args.output)?;
    file.set_len(sector_count * DEFAULT_BLOCK_SIZE as u64)?;

    let device = BlockDevice::new(file, DEFAULT_BLOCK_SIZE, sector_count);
    let mut volume = Volume::new(device);
    let options = FormatOptions {
        volume_identifier: args.label,
        ..FormatOptions::default()
    };
    volume.format(options)?;
    log::info!(
        "formatted {} ({sector_count} sectors of {DEFAULT_BLOCK_SIZE} bytes)",
        args.output.display()
    );
    Ok(())
}

fn open_existing(path: &PathBuf) -> Result<Volume<std::fs::File>, UdfError> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    let len = file.metadata()?.len();
    let device = BlockDevice::new(file, DEFAULT_BLOCK_SIZE, len / DEFAULT_BLOCK_SIZE as u64);
    let mut volume = Volume::new(device);
    volume.mount(MountOptions::default())?;
    Ok(volume)
}

fn ls(args: LsArgs) -> Result<(), UdfError> {
    let mut volume = open_existing(&args.input)?;
    volume.with_vcb(|vcb, device| {
        let root_location = FeLocation {
            partition_reference_number: vcb.root_icb.partition_reference_number(),
            lbn: vcb.root_icb.position(),
        };
        let root = ops::load_icb(vcb, device, root_location)?;
        let fids = ops::scan_directory(vcb, device, &root)?;
        for (fid, _) in fids {
            if fid.is_deleted() || fid.is_parent() {
                continue;
            }
            let kind = if fid.is_directory() { "d" } else { "-" };
            println!("{kind} {}", fid.file_identifier);
        }
        Ok(())
    })
}

fn cat(args: CatArgs) -> Result<(), UdfError> {
    let mut volume = open_existing(&args.input)?;
    let contents = volume.with_vcb(|vcb, device| {
        let location = find_entry(vcb, device, &args.name)?;
        let icb = ops::load_icb(vcb, device, location)?;
        let mut buf = vec![0u8; icb.information_length as usize];
        ops::read(vcb, device, &icb, 0, &mut buf)?;
        Ok(buf)
    })?;
    std::io::Write::write_all(&mut std::io::stdout(), &contents)?;
    Ok(())
}

fn put(args: PutArgs) -> Result<(), UdfError> {
    let name = args
        .name
        .or_else(|| args.source.file_name().map(|n| n.to_string_lossy().into_owned()))
        .ok_or(UdfError::InvalidParameter("source has no file name"))?;
    let contents = std::fs::read(&args.source)?;

    let mut volume = open_existing(&args.image)?;
    volume.with_vcb(|vcb, device| {
        let root_location = FeLocation {
            partition_reference_number: vcb.root_icb.partition_reference_number(),
            lbn: vcb.root_icb.position(),
        };
        let mut root = ops::load_icb(vcb, device, root_location)?;
        let fids = ops::scan_directory(vcb, device, &root)?;
        let mut index = hadris_udf::directory::DirectoryIndex::build(
            fids,
            vcb.root_icb,
            vcb.root_icb,
            vcb.options.pack_threshold,
        );
        let location = ops::create(vcb, device, &mut root, &mut index, 0, &name, false)?;
        let mut icb = ops::load_icb(vcb, device, location)?;
        ops::write(vcb, device, &mut icb, 0, 0, &contents)?;
        ops::store_icb(vcb, device, &icb)
    })?;
    volume.dismount()?;
    log::info!("wrote {} bytes to /{name}", contents.len());
    Ok(())
}

fn find_entry<T>(
    vcb: &mut hadris_udf::volume::Vcb,
    device: &mut BlockDevice<T>,
    name: &str,
) -> Result<FeLocation, UdfError>
where
    T: Read + Write + Seek,
{
    let root_location = FeLocation {
        partition_reference_number: vcb.root_icb.partition_reference_number(),
        lbn: vcb.root_icb.position(),
    };
    let root = ops::load_icb(vcb, device, root_location)?;
    let fids = ops::scan_directory(vcb, device, &root)?;
    for (fid, _) in fids {
        if fid.file_identifier == name {
            return Ok(FeLocation {
                partition_reference_number: fid.icb.partition_reference_number(),
                lbn: fid.icb.position(),
            });
        }
    }
    Err(UdfError::NotFound)
}
