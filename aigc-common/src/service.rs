//! Closed vocabularies shared by services, providers and models.
//!
//! Entity records keep these values as their canonical strings so that an
//! unknown value coming from an import payload can be reported precisely;
//! the enums below are the typed view used for validation and dispatch.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error returned when a string does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported {}: {:?}", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

macro_rules! vocabulary {
    (
        $(#[$meta:meta])*
        $name:ident as $kind:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// All variants for iteration.
            pub const ALL: &'static [$name] = &[ $( $name::$variant ),+ ];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $text ),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $name::ALL
                    .iter()
                    .copied()
                    .find(|v| v.as_str() == s)
                    .ok_or_else(|| UnknownVariant {
                        kind: $kind,
                        value: s.to_string(),
                    })
            }
        }
    };
}

vocabulary! {
    /// Logical capability a caller addresses by name.
    ServiceKind as "service" {
        Chat => "chat",
        Generate => "generate",
        Embed => "embed",
        /// Lists the models a backend can serve.
        Models => "models",
        TextToImage => "text_to_image",
    }
}

vocabulary! {
    /// Where a provider runs.
    ServiceSource as "service source" {
        Local => "local",
        Remote => "remote",
    }
}

vocabulary! {
    /// Rule for choosing between a service's local and remote provider.
    HybridPolicy as "hybrid policy" {
        Default => "default",
        AlwaysLocal => "always_local",
        AlwaysRemote => "always_remote",
    }
}

vocabulary! {
    /// Credential scheme a provider expects.
    AuthType as "auth type" {
        None => "none",
        ApiKey => "apikey",
        Token => "token",
        Credentials => "credentials",
    }
}

vocabulary! {
    /// Engine or API family spoken by a provider.
    Flavor as "flavor" {
        Ollama => "ollama",
        OpenAi => "openai",
        DeepSeek => "deepseek",
        Tencent => "tencent",
        Baidu => "baidu",
        AliYun => "aliyun",
        SmartVision => "smartvision",
    }
}

vocabulary! {
    /// Download state of a model record.
    ModelStatus as "model status" {
        Downloading => "downloading",
        Downloaded => "downloaded",
        Failed => "failed",
    }
}

impl HybridPolicy {
    /// Parses a policy where an empty string means `default`.
    pub fn parse_or_default(s: &str) -> Result<Self, UnknownVariant> {
        if s.is_empty() {
            Ok(HybridPolicy::Default)
        } else {
            s.parse()
        }
    }
}

impl ModelStatus {
    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// `failed` re-enters the pipeline through `downloading` only.
    pub fn can_transition_to(&self, next: ModelStatus) -> bool {
        matches!(
            (self, next),
            (ModelStatus::Downloading, ModelStatus::Downloaded)
                | (ModelStatus::Downloading, ModelStatus::Failed)
                | (ModelStatus::Failed, ModelStatus::Downloading)
                | (ModelStatus::Downloaded, ModelStatus::Downloading)
        )
    }

    /// States a record passes through from `self` to `next`, `next` last.
    ///
    /// Empty when already there; jumps the table forbids go via `downloading`.
    pub fn steps_to(self, next: ModelStatus) -> Vec<ModelStatus> {
        if self == next {
            Vec::new()
        } else if self.can_transition_to(next) {
            vec![next]
        } else {
            vec![ModelStatus::Downloading, next]
        }
    }
}
