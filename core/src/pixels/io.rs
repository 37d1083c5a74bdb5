use super::PixelMap;
use crate::prelude::DestripeResult;
use log::info;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Destination for the maps produced by the map-maker.
pub trait MapSink {
    fn write_map(&mut self, name: &str, map: &PixelMap) -> DestripeResult<()>;
}

/// Writes every map to `<outdir>/<name>.json`.
#[derive(Debug, Clone)]
pub struct JsonMapSink {
    outdir: PathBuf,
}

impl JsonMapSink {
    pub fn new(outdir: impl Into<PathBuf>) -> Self {
        Self {
            outdir: outdir.into(),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.outdir.join(format!("{}.json", name))
    }
}

impl MapSink for JsonMapSink {
    fn write_map(&mut self, name: &str, map: &PixelMap) -> DestripeResult<()> {
        let path = self.path(name);
        map.write_json(&path)?;
        info!("Wrote {} to {}", name, path.display());
        Ok(())
    }
}

/// Keeps written maps in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    maps: BTreeMap<String, PixelMap>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&PixelMap> {
        self.maps.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.maps.keys().map(String::as_str)
    }
}

impl MapSink for MemorySink {
    fn write_map(&mut self, name: &str, map: &PixelMap) -> DestripeResult<()> {
        self.maps.insert(name.to_string(), map.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_sink_writes_named_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = JsonMapSink::new(dir.path().join("out"));
        let map = PixelMap::zeros(3, 1);
        sink.write_map("run_hits", &map).unwrap();
        let written = PixelMap::read_json(&dir.path().join("out").join("run_hits.json")).unwrap();
        assert_eq!(written, map);
    }

    #[test]
    fn memory_sink_replaces_maps() {
        let mut sink = MemorySink::new();
        sink.write_map("binned", &PixelMap::zeros(2, 3)).unwrap();
        let mut second = PixelMap::zeros(2, 3);
        second.fill(1.0);
        sink.write_map("binned", &second).unwrap();
        assert_eq!(sink.get("binned"), Some(&second));
        assert_eq!(sink.names().collect::<Vec<_>>(), vec!["binned"]);
    }
}
