use std::{collections::HashMap, path::Path, str::FromStr};

use crate::error::DetectError;

/// One `[section]` of a Darknet config file.
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    /// Section name without brackets, e.g. `convolutional`.
    pub kind: String,
    /// Line number of the section header, for error messages.
    pub line: usize,
    params: HashMap<String, String>,
}

impl Section {
    fn new(kind: &str, line: usize) -> Self {
        Self {
            kind: kind.to_string(),
            line,
            params: HashMap::new(),
        }
    }

    /// Raw value of a key, if present.
    pub fn raw(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Parse a required key.
    pub fn get<T: FromStr>(&self, key: &str) -> Result<T, DetectError> {
        let value = self.raw(key).ok_or_else(|| {
            DetectError::InvalidConfig(format!(
                "[{}] at line {} is missing `{key}`",
                self.kind, self.line
            ))
        })?;
        self.parse(key, value)
    }

    /// Parse an optional key, falling back to `default`.
    pub fn get_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, DetectError> {
        match self.raw(key) {
            Some(value) => self.parse(key, value),
            None => Ok(default),
        }
    }

    /// Parse a comma separated list. A missing key yields an empty list.
    pub fn get_list<T: FromStr>(&self, key: &str) -> Result<Vec<T>, DetectError> {
        match self.raw(key) {
            Some(value) => value
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(|v| self.parse(key, v))
                .collect(),
            None => Ok(Vec::new()),
        }
    }

    fn parse<T: FromStr>(&self, key: &str, value: &str) -> Result<T, DetectError> {
        value.trim().parse().map_err(|_| {
            DetectError::InvalidConfig(format!(
                "[{}] at line {}: cannot parse `{key}={value}`",
                self.kind, self.line
            ))
        })
    }
}

/// A parsed Darknet network config.
#[derive(Debug, Clone)]
pub struct DarknetConfig {
    /// The leading `[net]` section with the hyper parameters.
    pub net: Section,
    /// The layer sections, in file order.
    pub layers: Vec<Section>,
}

impl DarknetConfig {
    /// Read and parse a `.cfg` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DetectError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| DetectError::from_io(e, path))?;
        text.parse()
    }
}

impl FromStr for DarknetConfig {
    type Err = DetectError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut sections: Vec<Section> = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let line_no = index + 1;
            if let Some(name) = line.strip_prefix('[') {
                let name = name.strip_suffix(']').ok_or_else(|| {
                    DetectError::InvalidConfig(format!("unterminated section at line {line_no}"))
                })?;
                sections.push(Section::new(name.trim(), line_no));
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                DetectError::InvalidConfig(format!("expected key=value at line {line_no}"))
            })?;
            let section = sections.last_mut().ok_or_else(|| {
                DetectError::InvalidConfig(format!("option outside a section at line {line_no}"))
            })?;
            section
                .params
                .insert(key.trim().to_string(), value.trim().to_string());
        }

        let mut sections = sections.into_iter();
        let net = match sections.next() {
            Some(s) if s.kind == "net" || s.kind == "network" => s,
            _ => {
                return Err(DetectError::InvalidConfig(
                    "config must start with a [net] section".to_string(),
                ));
            }
        };

        Ok(Self {
            net,
            layers: sections.collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CFG: &str = "
# comment
[net]
width=416
height = 416
channels=3

[convolutional]
batch_normalize=1
filters=32
size=3
activation=leaky

; comment
[yolo]
mask = 0,1,2
anchors = 10,13,  16,30,  33,23
classes=80
";

    #[test]
    fn test_parse_sections() -> Result<(), DetectError> {
        let cfg: DarknetConfig = CFG.parse()?;
        assert_eq!(cfg.net.get::<usize>("width")?, 416);
        assert_eq!(cfg.net.get::<usize>("height")?, 416);
        assert_eq!(cfg.layers.len(), 2);
        assert_eq!(cfg.layers[0].kind, "convolutional");
        assert_eq!(cfg.layers[0].get::<usize>("filters")?, 32);
        assert_eq!(cfg.layers[0].get_or::<usize>("stride", 1)?, 1);
        assert_eq!(cfg.layers[1].get_list::<usize>("mask")?, vec![0, 1, 2]);
        assert_eq!(
            cfg.layers[1].get_list::<f32>("anchors")?,
            vec![10., 13., 16., 30., 33., 23.]
        );
        Ok(())
    }

    #[test]
    fn test_missing_and_bad_values() -> Result<(), DetectError> {
        let cfg: DarknetConfig = CFG.parse()?;
        assert!(cfg.layers[0].get::<usize>("groups").is_err());
        assert!(cfg.layers[0].get::<usize>("activation").is_err());
        Ok(())
    }

    #[test]
    fn test_requires_net_section() {
        let err = "[convolutional]\nfilters=3\n".parse::<DarknetConfig>();
        assert!(matches!(err, Err(DetectError::InvalidConfig(_))));
        let err = "width=3\n".parse::<DarknetConfig>();
        assert!(matches!(err, Err(DetectError::InvalidConfig(_))));
    }
}
