//! Environment templates.
//!
//! Each [`EnvironmentType`] has a template providing default creation
//! parameters. The control side uses them to prefill the create form; the
//! agent applies them to incoming payloads so unset fields never reach the
//! backend empty.

use crate::catalog::{
    CreateEnvPayload, EnvironmentType, MinecraftConfig, FEATURE_AIKAR_FLAGS,
};

pub const STANDARD_DEFAULT_IMAGE: &str = "ubuntu:latest";
pub const MINECRAFT_DEFAULT_IMAGE: &str = "itzg/minecraft-server";
pub const MINECRAFT_DEFAULT_PORT: &str = "25565:25565";
pub const MINECRAFT_DEFAULT_MOTD: &str = "A PerSSH Managed Server";

/// Known Minecraft server flavours, in the order the create form offers them.
pub const MINECRAFT_SERVER_TYPES: [&str; 4] = ["VANILLA", "FORGE", "FABRIC", "ARCLIGHT"];

/// Behaviour of one environment type.
pub trait EnvTemplate: Send + Sync {
    /// Human readable name, e.g. "Minecraft Server (Java)".
    fn display_name(&self) -> &'static str;

    fn kind(&self) -> EnvironmentType;

    /// Default creation payload. `kind` always equals [`EnvTemplate::kind`].
    fn defaults(&self) -> CreateEnvPayload;
}

pub struct StandardTemplate;

impl EnvTemplate for StandardTemplate {
    fn display_name(&self) -> &'static str {
        "Standard Docker Container"
    }

    fn kind(&self) -> EnvironmentType {
        EnvironmentType::Standard
    }

    fn defaults(&self) -> CreateEnvPayload {
        CreateEnvPayload {
            kind: EnvironmentType::Standard,
            image: STANDARD_DEFAULT_IMAGE.to_string(),
            ..Default::default()
        }
    }
}

pub struct MinecraftTemplate;

impl EnvTemplate for MinecraftTemplate {
    fn display_name(&self) -> &'static str {
        "Minecraft Server (Java)"
    }

    fn kind(&self) -> EnvironmentType {
        EnvironmentType::Minecraft
    }

    fn defaults(&self) -> CreateEnvPayload {
        CreateEnvPayload {
            kind: EnvironmentType::Minecraft,
            image: MINECRAFT_DEFAULT_IMAGE.to_string(),
            ports: vec![MINECRAFT_DEFAULT_PORT.to_string()],
            minecraft: Some(MinecraftConfig {
                eula: Some(true),
                server_type: Some(MINECRAFT_SERVER_TYPES[0].to_string()),
                version: Some("latest".to_string()),
                motd: Some(MINECRAFT_DEFAULT_MOTD.to_string()),
                features: Some(vec![FEATURE_AIKAR_FLAGS.to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

static TEMPLATES: [&dyn EnvTemplate; 2] = [&StandardTemplate, &MinecraftTemplate];

/// All templates, in display order.
pub fn registry() -> &'static [&'static dyn EnvTemplate] {
    &TEMPLATES
}

pub fn template_for(kind: EnvironmentType) -> &'static dyn EnvTemplate {
    match kind {
        EnvironmentType::Standard => &StandardTemplate,
        EnvironmentType::Minecraft => &MinecraftTemplate,
    }
}

impl CreateEnvPayload {
    /// Fill every unset field from the template of this payload's type.
    /// Fields the caller set, including explicitly empty lists, are kept.
    pub fn apply_template_defaults(&mut self) {
        let defaults = template_for(self.kind).defaults();

        if self.image.trim().is_empty() {
            self.image = defaults.image;
        }
        if self.ports.is_empty() {
            self.ports = defaults.ports;
        }
        if self.ram_limit.as_deref().map_or(true, str::is_empty) {
            self.ram_limit = defaults.ram_limit;
        }
        match (self.minecraft.as_mut(), defaults.minecraft) {
            (Some(block), Some(template)) => block.fill_from(template),
            (None, Some(template)) => self.minecraft = Some(template),
            _ => {}
        }
    }
}

impl MinecraftConfig {
    fn fill_from(&mut self, template: MinecraftConfig) {
        fill(&mut self.server_type, template.server_type);
        fill(&mut self.version, template.version);
        fill(&mut self.motd, template.motd);
        fill(&mut self.modpack, template.modpack);
        if self.eula.is_none() {
            self.eula = template.eula;
        }
        if self.features.is_none() {
            self.features = template.features;
        }
    }
}

fn fill(slot: &mut Option<String>, default: Option<String>) {
    if slot.as_deref().map_or(true, |s| s.trim().is_empty()) {
        *slot = default;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry() {
        assert!(!registry().is_empty());
        for template in registry() {
            assert!(!template.display_name().is_empty());
            let defaults = template.defaults();
            assert_eq!(defaults.kind, template.kind());
            assert_eq!(template_for(template.kind()).kind(), template.kind());
        }
        assert_eq!(
            template_for(EnvironmentType::Minecraft).defaults().image,
            MINECRAFT_DEFAULT_IMAGE
        );
    }

    #[test]
    fn test_empty_minecraft_block_gets_defaults() {
        let mut payload = CreateEnvPayload {
            name: "survival".to_string(),
            kind: EnvironmentType::Minecraft,
            minecraft: Some(MinecraftConfig::default()),
            ..Default::default()
        };
        payload.apply_template_defaults();

        assert_eq!(payload.image, MINECRAFT_DEFAULT_IMAGE);
        assert_eq!(payload.ports, vec![MINECRAFT_DEFAULT_PORT.to_string()]);
        let block = payload.minecraft.unwrap();
        assert_eq!(block.eula, Some(true));
        assert_eq!(block.server_type.as_deref(), Some("VANILLA"));
        assert_eq!(block.version.as_deref(), Some("latest"));
        assert!(block.has_feature(FEATURE_AIKAR_FLAGS));
    }

    #[test]
    fn test_explicit_fields_survive() {
        let mut payload = CreateEnvPayload {
            kind: EnvironmentType::Minecraft,
            image: "custom/mc:java21".to_string(),
            minecraft: Some(MinecraftConfig {
                eula: Some(false),
                version: Some("1.20.4".to_string()),
                features: Some(vec![]),
                ..Default::default()
            }),
            ..Default::default()
        };
        payload.apply_template_defaults();

        assert_eq!(payload.image, "custom/mc:java21");
        let block = payload.minecraft.unwrap();
        assert_eq!(block.eula, Some(false));
        assert_eq!(block.version.as_deref(), Some("1.20.4"));
        assert_eq!(block.features, Some(vec![]));
        assert_eq!(block.motd.as_deref(), Some(MINECRAFT_DEFAULT_MOTD));
    }

    #[test]
    fn test_standard_default_image() {
        let mut payload = CreateEnvPayload {
            name: "box".to_string(),
            ..Default::default()
        };
        payload.apply_template_defaults();
        assert_eq!(payload.image, STANDARD_DEFAULT_IMAGE);
        assert!(payload.minecraft.is_none());
        assert!(payload.ports.is_empty());
    }
}
