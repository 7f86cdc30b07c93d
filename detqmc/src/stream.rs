//! Configuration stream output: append the field configuration to text
//! and/or binary stream files during measurement sweeps.
//!
//! The scalars are written in a fixed order (ix outermost, then iy,
//! then the time slice, then the field component innermost) so that
//! external tooling can reshape the stream without metadata beyond the
//! `.infoheader` companion files.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::config::ModelParams;
use crate::error::Result;
use crate::fields::FieldConfig;

pub struct ConfigStreamWriter {
    text_phi: Option<BufWriter<File>>,
    binary_phi: Option<BufWriter<File>>,
    text_cdwl: Option<BufWriter<File>>,
    binary_cdwl: Option<BufWriter<File>>,
    l: usize,
    m: usize,
}

fn open_append(path: &Path) -> Result<BufWriter<File>> {
    Ok(BufWriter::new(
        OpenOptions::new().create(true).append(true).open(path)?,
    ))
}

fn write_infoheader(path: &Path, pars: &ModelParams, extra: &[(&str, String)]) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for (name, value) in pars.metadata() {
        writeln!(out, "# {} = {}", name, value)?;
    }
    for (name, value) in extra {
        writeln!(out, "# {} = {}", name, value)?;
    }
    Ok(())
}

impl ConfigStreamWriter {
    /// Create appenders in `dir`. The `.infoheader` companions are
    /// rewritten each time so they always match the parameters.
    pub fn new(dir: &Path, pars: &ModelParams, text: bool, binary: bool) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = |name: &str| -> PathBuf { dir.join(name) };

        let mut writer = ConfigStreamWriter {
            text_phi: None,
            binary_phi: None,
            text_cdwl: None,
            binary_cdwl: None,
            l: pars.l,
            m: pars.m,
        };

        let order_note = [(
            "index_order",
            "ix outer, iy, timeslice, component inner".to_string(),
        )];
        if text {
            write_infoheader(&path("phi.series.infoheader"), pars, &order_note)?;
            writer.text_phi = Some(open_append(&path("phi.series"))?);
        }
        if binary {
            write_infoheader(&path("phi.bin.infoheader"), pars, &order_note)?;
            writer.binary_phi = Some(open_append(&path("phi.bin"))?);
        }
        if pars.cdw_u != 0.0 {
            if text {
                write_infoheader(&path("cdwl.series.infoheader"), pars, &order_note)?;
                writer.text_cdwl = Some(open_append(&path("cdwl.series"))?);
            }
            if binary {
                write_infoheader(&path("cdwl.bin.infoheader"), pars, &order_note)?;
                writer.binary_cdwl = Some(open_append(&path("cdwl.bin"))?);
            }
        }
        Ok(writer)
    }

    /// Append one field configuration to every enabled stream.
    pub fn append<const OPDIM: usize>(&mut self, field: &FieldConfig<OPDIM>) -> Result<()> {
        let l = self.l;
        let m = self.m;
        for ix in 0..l {
            for iy in 0..l {
                let site = iy * l + ix;
                for k in 1..=m {
                    for dim in 0..OPDIM {
                        let value = field.phi_comp(site, dim, k);
                        if let Some(out) = self.text_phi.as_mut() {
                            writeln!(out, "{:e}", value)?;
                        }
                        if let Some(out) = self.binary_phi.as_mut() {
                            out.write_all(&value.to_le_bytes())?;
                        }
                    }
                    if self.text_cdwl.is_some() || self.binary_cdwl.is_some() {
                        let value = field.cdwl(site, k);
                        if let Some(out) = self.text_cdwl.as_mut() {
                            writeln!(out, "{}", value)?;
                        }
                        if let Some(out) = self.binary_cdwl.as_mut() {
                            out.write_all(&value.to_le_bytes())?;
                        }
                    }
                }
            }
        }
        self.flush()
    }

    pub fn flush(&mut self) -> Result<()> {
        for out in [&mut self.text_phi, &mut self.binary_phi].into_iter().flatten() {
            out.flush()?;
        }
        for out in [&mut self.text_cdwl, &mut self.binary_cdwl]
            .into_iter()
            .flatten()
        {
            out.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    #[test]
    fn streams_carry_the_full_configuration_in_order() {
        let cfg = ModelConfig {
            l: Some(2),
            m: Some(4),
            dtau: Some(0.1),
            s: Some(2),
            r: Some(1.0),
            opdim: Some(2),
            ..Default::default()
        };
        let pars = ModelParams::resolve(&cfg).unwrap();
        let mut field = FieldConfig::<2>::new(&pars);
        let mut rng = Pcg64::seed_from_u64(5);
        field.init_random(&mut rng);

        let dir = std::env::temp_dir().join("detqmc-stream-test");
        let _ = std::fs::remove_dir_all(&dir);
        {
            let mut writer = ConfigStreamWriter::new(&dir, &pars, true, true).unwrap();
            writer.append(&field).unwrap();
        }

        let text = std::fs::read_to_string(dir.join("phi.series")).unwrap();
        let values: Vec<f64> = text
            .lines()
            .map(|line| line.parse::<f64>().unwrap())
            .collect();
        let expected = pars.num_sites() * 2 * pars.m;
        assert_eq!(values.len(), expected);

        // first scalars follow site (ix=0, iy=0), slice k=1, dims 0..2
        assert_eq!(values[0], field.phi_comp(0, 0, 1));
        assert_eq!(values[1], field.phi_comp(0, 1, 1));
        // then slice k=2 of the same site
        assert_eq!(values[2], field.phi_comp(0, 0, 2));

        // ix runs outermost, iy next: after all slices of (ix=0, iy=0)
        // comes (ix=0, iy=1), which is site index 2 on the 2x2 torus
        let per_site = 2 * pars.m;
        assert_eq!(values[per_site], field.phi_comp(2, 0, 1));

        let binary = std::fs::read(dir.join("phi.bin")).unwrap();
        assert_eq!(binary.len(), expected * 8);
        let first = f64::from_le_bytes(binary[0..8].try_into().unwrap());
        assert_eq!(first, field.phi_comp(0, 0, 1));

        assert!(dir.join("phi.series.infoheader").exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
