//! Container file format for sub-map collections
//!
//! A single little-endian file stores, in order: a collection header,
//! every sub-map (pose, then its TSDF blocks), and the registration
//! constraints. Layout:
//!
//! ```text
//! header      { version: u16, voxel_size: f32, voxels_per_side: u16, n_submaps: u32 }
//! per submap  { id: u32, pose[7] = (qx,qy,qz,qw,tx,ty,tz): f32, n_blocks: u32, blocks[..] }
//! per block   { bx, by, bz: i32, S³ × (distance: f32, weight: f32) }
//! trailer     { n_constraints: u32, constraints[..] }
//! constraint  { first: u32, second: u32, information: 16 × f64 row-major }
//! ```
//!
//! A voxel is observed iff its stored weight is positive. Loaded
//! sub-maps come back sealed; ESDF generation is left to the caller.

use crate::collection::{SubmapCollection, DEFAULT_CREATION_INTERVAL_NS};
use crate::error::{Error, Result};
use crate::pose_graph::InformationMatrix;
use crate::submap::{Submap, SubmapConfig, SubmapId};
use crate::transform::Pose;
use crate::voxel::{GlobalIndex, LocalIndex, TsdfVoxel};
use nalgebra::{Isometry3, Quaternion, Translation3, UnitQuaternion};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Current container format version
pub const FORMAT_VERSION: u16 = 1;

// Voxel runs are memcpy'd through bytemuck; the format is defined as
// little-endian, which is the native order of every supported target.
#[cfg(not(target_endian = "little"))]
compile_error!("the container format requires a little-endian target");

/// A registration constraint as persisted in the container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerConstraint {
    pub first: SubmapId,
    pub second: SubmapId,
    pub information: InformationMatrix,
}

fn write_u16<W: Write>(w: &mut W, v: u16) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_u32<W: Write>(w: &mut W, v: u32) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_i32<W: Write>(w: &mut W, v: i32) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_f32<W: Write>(w: &mut W, v: f32) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_f64<W: Write>(w: &mut W, v: f64) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn read_exact<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<()> {
    r.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::CorruptContainer("truncated file".to_string())
        } else {
            Error::IoError(e.to_string())
        }
    })
}

fn read_u16<R: Read>(r: &mut R) -> Result<u16> {
    let mut buf = [0u8; 2];
    read_exact(r, &mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact(r, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_i32<R: Read>(r: &mut R) -> Result<i32> {
    let mut buf = [0u8; 4];
    read_exact(r, &mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_f32<R: Read>(r: &mut R) -> Result<f32> {
    let mut buf = [0u8; 4];
    read_exact(r, &mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

fn read_f64<R: Read>(r: &mut R) -> Result<f64> {
    let mut buf = [0u8; 8];
    read_exact(r, &mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

fn write_pose<W: Write>(w: &mut W, pose: &Pose) -> Result<()> {
    let q = pose.rotation.quaternion();
    let t = pose.translation.vector;
    for v in [q.i, q.j, q.k, q.w, t.x, t.y, t.z] {
        write_f32(w, v as f32)?;
    }
    Ok(())
}

fn read_pose<R: Read>(r: &mut R) -> Result<Pose> {
    let mut p = [0f32; 7];
    for v in p.iter_mut() {
        *v = read_f32(r)?;
    }
    let quaternion = Quaternion::new(p[3] as f64, p[0] as f64, p[1] as f64, p[2] as f64);
    let rotation = UnitQuaternion::from_quaternion(quaternion);
    let translation = Translation3::new(p[4] as f64, p[5] as f64, p[6] as f64);
    Ok(Isometry3::from_parts(translation, rotation))
}

/// Serialize a collection and its constraints
pub fn write_container<W: Write>(
    writer: &mut W,
    collection: &SubmapCollection,
    constraints: &[ContainerConstraint],
) -> Result<()> {
    let config = collection.config();
    write_u16(writer, FORMAT_VERSION)?;
    write_f32(writer, config.voxel_size)?;
    write_u16(writer, config.voxels_per_side as u16)?;
    write_u32(writer, collection.len() as u32)?;

    for id in collection.ids() {
        let submap = collection.submap(id)?;
        write_u32(writer, id)?;
        write_pose(writer, submap.pose())?;

        let grid = submap.tsdf_grid();
        let mut block_indices: Vec<_> = grid.block_indices().copied().collect();
        block_indices.sort_unstable();
        write_u32(writer, block_indices.len() as u32)?;

        let mut run: Vec<f32> = Vec::with_capacity(2 * (config.voxels_per_side as usize).pow(3));
        for block_index in block_indices {
            write_i32(writer, block_index.x)?;
            write_i32(writer, block_index.y)?;
            write_i32(writer, block_index.z)?;

            let block = grid
                .block_by_index(block_index)
                .expect("index came from the grid");
            run.clear();
            for voxel in block.as_slice() {
                run.push(voxel.distance);
                run.push(voxel.weight);
            }
            writer.write_all(bytemuck::cast_slice(&run))?;
        }
    }

    write_u32(writer, constraints.len() as u32)?;
    for constraint in constraints {
        write_u32(writer, constraint.first)?;
        write_u32(writer, constraint.second)?;
        for row in 0..4 {
            for col in 0..4 {
                write_f64(writer, constraint.information[(row, col)])?;
            }
        }
    }
    Ok(())
}

/// Deserialize a collection and its constraints
///
/// `template` supplies the parameters the container does not carry
/// (truncation band, weight threshold, ESDF settings); voxel size and
/// block side come from the header.
pub fn read_container<R: Read>(
    reader: &mut R,
    template: &SubmapConfig,
) -> Result<(SubmapCollection, Vec<ContainerConstraint>)> {
    let version = read_u16(reader)?;
    if version != FORMAT_VERSION {
        return Err(Error::CorruptContainer(format!(
            "unknown container version {version}"
        )));
    }
    let voxel_size = read_f32(reader)?;
    if !(voxel_size > 0.0) {
        return Err(Error::CorruptContainer(format!(
            "non-positive voxel size {voxel_size}"
        )));
    }
    let voxels_per_side = read_u16(reader)? as u32;
    if voxels_per_side == 0 {
        return Err(Error::CorruptContainer("zero voxels per side".to_string()));
    }
    let n_submaps = read_u32(reader)?;

    let config = SubmapConfig {
        voxel_size,
        voxels_per_side,
        // Registration ESDFs are generated on demand by the caller
        generate_esdf_on_seal: false,
        ..template.clone()
    };
    let mut collection = SubmapCollection::new(config.clone(), DEFAULT_CREATION_INTERVAL_NS);

    let voxels_per_block = (voxels_per_side as usize).pow(3);
    for _ in 0..n_submaps {
        let id = read_u32(reader)?;
        let pose = read_pose(reader)?;
        let n_blocks = read_u32(reader)?;

        let mut submap = Submap::new(id, pose, 0, config.clone());
        let mut run: Vec<f32> = vec![0.0; 2 * voxels_per_block];
        for _ in 0..n_blocks {
            let bx = read_i32(reader)?;
            let by = read_i32(reader)?;
            let bz = read_i32(reader)?;

            read_exact(reader, bytemuck::cast_slice_mut(&mut run))?;
            let block = crate::voxel::BlockIndex::new(bx, by, bz);
            for linear in 0..voxels_per_block {
                let local = LocalIndex::from_linear(linear, voxels_per_side);
                let global = GlobalIndex::from_parts(block, local, voxels_per_side);
                *submap.tsdf_grid_mut().voxel_mut_at(global) = TsdfVoxel {
                    distance: run[2 * linear],
                    weight: run[2 * linear + 1],
                };
            }
        }
        submap.seal();
        collection.insert_submap(submap);
    }

    let n_constraints = read_u32(reader)?;
    let mut constraints = Vec::with_capacity(n_constraints as usize);
    for _ in 0..n_constraints {
        let first = read_u32(reader)?;
        let second = read_u32(reader)?;
        let mut information = InformationMatrix::zeros();
        for row in 0..4 {
            for col in 0..4 {
                information[(row, col)] = read_f64(reader)?;
            }
        }
        constraints.push(ContainerConstraint {
            first,
            second,
            information,
        });
    }

    // The trailer must be the end of the file
    let mut excess = [0u8; 1];
    match reader.read(&mut excess) {
        Ok(0) => {}
        Ok(_) => {
            return Err(Error::CorruptContainer(
                "trailing bytes after constraints".to_string(),
            ))
        }
        Err(e) => return Err(Error::IoError(e.to_string())),
    }

    Ok((collection, constraints))
}

/// Write a collection to a file
pub fn save_to_file<P: AsRef<Path>>(
    path: P,
    collection: &SubmapCollection,
    constraints: &[ContainerConstraint],
) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    write_container(&mut writer, collection, constraints)?;
    writer.flush()?;
    Ok(())
}

/// Read a collection from a file
pub fn load_from_file<P: AsRef<Path>>(
    path: P,
    template: &SubmapConfig,
) -> Result<(SubmapCollection, Vec<ContainerConstraint>)> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    read_container(&mut reader, template)
}
