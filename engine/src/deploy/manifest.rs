//! Build manifest synthesis
//!
//! Decides how a project tree becomes an image and which port the resulting
//! container listens on. A project that ships its own `Dockerfile` is used
//! as-is; otherwise the first matching rule in [`RULES`] picks a template.
//! This module is the only place that knows a container's internal port.

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;
use tokio::fs;
use tracing::{debug, info};

use crate::errors::EngineError;

/// Name of the build file consumed by the image build
pub const BUILD_FILE: &str = "Dockerfile";

/// Internal port assumed for a supplied build file that declares none
pub const DEFAULT_SUPPLIED_PORT: u16 = 3000;

const PYTHON_MARKERS: &[&str] = &["requirements.txt", "setup.py", "pyproject.toml"];

/// Known project templates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Template {
    NextJs,
    React,
    Node,
    Python,
    Static,
}

/// Pure data describing how to build and serve one kind of project
#[derive(Debug, Clone, Copy)]
pub struct TemplateSpec {
    pub name: &'static str,
    pub internal_port: u16,
    pub build_file: &'static str,
}

const NEXTJS: TemplateSpec = TemplateSpec {
    name: "nextjs",
    internal_port: 3000,
    build_file: r#"FROM node:18-alpine AS builder
WORKDIR /app
COPY package*.json ./
RUN npm ci
COPY . .
RUN npm run build

FROM node:18-alpine
WORKDIR /app
ENV NODE_ENV=production
COPY --from=builder /app ./
EXPOSE 3000
CMD ["npm", "start"]
"#,
};

const REACT: TemplateSpec = TemplateSpec {
    name: "react",
    internal_port: 80,
    build_file: r#"FROM node:18-alpine AS builder
WORKDIR /app
COPY package*.json ./
RUN npm ci
COPY . .
RUN npm run build

FROM nginx:alpine
COPY --from=builder /app/build /usr/share/nginx/html
EXPOSE 80
CMD ["nginx", "-g", "daemon off;"]
"#,
};

const NODE: TemplateSpec = TemplateSpec {
    name: "node",
    internal_port: 3000,
    build_file: r#"FROM node:18-alpine
WORKDIR /app
COPY package*.json ./
RUN npm install --omit=dev
COPY . .
ENV PORT=3000
EXPOSE 3000
CMD ["npm", "start"]
"#,
};

const PYTHON: TemplateSpec = TemplateSpec {
    name: "python",
    internal_port: 8000,
    build_file: r#"FROM python:3.11-slim
WORKDIR /app
COPY . .
RUN if [ -f requirements.txt ]; then pip install --no-cache-dir -r requirements.txt; fi
ENV PORT=8000
EXPOSE 8000
CMD ["python", "app.py"]
"#,
};

const STATIC: TemplateSpec = TemplateSpec {
    name: "static",
    internal_port: 80,
    build_file: r#"FROM nginx:alpine
COPY . /usr/share/nginx/html
EXPOSE 80
CMD ["nginx", "-g", "daemon off;"]
"#,
};

impl Template {
    pub fn spec(self) -> &'static TemplateSpec {
        match self {
            Template::NextJs => &NEXTJS,
            Template::React => &REACT,
            Template::Node => &NODE,
            Template::Python => &PYTHON,
            Template::Static => &STATIC,
        }
    }
}

/// Where a manifest came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestOrigin {
    Synthesized(Template),
    Supplied,
}

/// Internal port plus build instructions for one project
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildManifest {
    pub internal_port: u16,
    pub build_file: String,
    pub origin: ManifestOrigin,
}

impl BuildManifest {
    fn from_template(template: Template) -> Self {
        let spec = template.spec();
        Self {
            internal_port: spec.internal_port,
            build_file: spec.build_file.to_string(),
            origin: ManifestOrigin::Synthesized(template),
        }
    }

    pub fn describe(&self) -> String {
        match self.origin {
            ManifestOrigin::Synthesized(t) => format!(
                "No Dockerfile found, generated one for a {} project (port {})",
                t.spec().name,
                self.internal_port
            ),
            ManifestOrigin::Supplied => {
                format!("Using project Dockerfile (port {})", self.internal_port)
            }
        }
    }

    /// Write a synthesized build file into the project tree
    pub async fn materialize(&self, project_path: &Path) -> Result<(), EngineError> {
        if self.origin == ManifestOrigin::Supplied {
            return Ok(());
        }
        fs::write(project_path.join(BUILD_FILE), &self.build_file).await?;
        Ok(())
    }
}

/// What detection rules look at
#[derive(Debug, Clone, Default)]
pub struct ProjectFacts {
    /// File names at the project root
    pub files: HashSet<String>,
    /// `dependencies` and `devDependencies` names from `package.json`
    pub dependencies: HashSet<String>,
}

impl ProjectFacts {
    pub async fn gather(project_path: &Path) -> Result<Self, EngineError> {
        let mut files = HashSet::new();
        let mut entries = fs::read_dir(project_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.insert(entry.file_name().to_string_lossy().into_owned());
            }
        }

        let mut dependencies = HashSet::new();
        if files.contains("package.json") {
            let raw = fs::read(project_path.join("package.json")).await?;
            dependencies = package_dependencies(&raw);
        }

        Ok(Self {
            files,
            dependencies,
        })
    }

    fn has(&self, name: &str) -> bool {
        self.files.contains(name)
    }

    fn depends_on(&self, name: &str) -> bool {
        self.dependencies.contains(name)
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PackageJson {
    #[serde(default)]
    dependencies: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    dev_dependencies: serde_json::Map<String, serde_json::Value>,
}

fn package_dependencies(raw: &[u8]) -> HashSet<String> {
    match serde_json::from_slice::<PackageJson>(raw) {
        Ok(pkg) => pkg
            .dependencies
            .into_iter()
            .chain(pkg.dev_dependencies)
            .map(|(name, _)| name)
            .collect(),
        Err(e) => {
            debug!("Unreadable package.json, ignoring dependencies: {}", e);
            HashSet::new()
        }
    }
}

/// A detection rule: predicate over project facts and the template it selects
pub struct Rule {
    pub name: &'static str,
    pub matches: fn(&ProjectFacts) -> bool,
    pub template: Template,
}

/// Detection rules in priority order. First match wins.
pub const RULES: &[Rule] = &[
    Rule {
        name: "next dependency",
        matches: |f| f.has("package.json") && f.depends_on("next"),
        template: Template::NextJs,
    },
    Rule {
        name: "react-scripts dependency",
        matches: |f| f.has("package.json") && f.depends_on("react-scripts"),
        template: Template::React,
    },
    Rule {
        name: "package.json",
        matches: |f| f.has("package.json"),
        template: Template::Node,
    },
    Rule {
        name: "python marker",
        matches: |f| PYTHON_MARKERS.iter().any(|m| f.has(m)),
        template: Template::Python,
    },
    Rule {
        name: "html file",
        matches: |f| f.files.iter().any(|name| name.ends_with(".html")),
        template: Template::Static,
    },
];

/// Template used when no rule matches
pub const FALLBACK: Template = Template::Node;

/// Pick a template from project facts
pub fn select_template(facts: &ProjectFacts) -> Template {
    RULES
        .iter()
        .find(|rule| (rule.matches)(facts))
        .map(|rule| {
            debug!("Detection rule matched: {}", rule.name);
            rule.template
        })
        .unwrap_or(FALLBACK)
}

/// Internal port declared by the first parsable `EXPOSE` instruction
pub fn declared_port(build_file: &str) -> Option<u16> {
    build_file
        .lines()
        .map(str::trim)
        .filter_map(|line| {
            let (instruction, rest) = line.split_once(char::is_whitespace)?;
            instruction.eq_ignore_ascii_case("EXPOSE").then_some(rest)
        })
        .flat_map(str::split_whitespace)
        .find_map(|token| {
            token
                .split('/')
                .next()
                .and_then(|port| port.parse::<u16>().ok())
        })
}

/// Work out the build manifest for the project at `project_path`
pub async fn detect(project_path: &Path) -> Result<BuildManifest, EngineError> {
    let supplied = project_path.join(BUILD_FILE);
    if fs::metadata(&supplied).await.map(|m| m.is_file()).unwrap_or(false) {
        let build_file = fs::read_to_string(&supplied).await?;
        let internal_port = declared_port(&build_file).unwrap_or(DEFAULT_SUPPLIED_PORT);
        info!("Project supplies its own {} (port {})", BUILD_FILE, internal_port);
        return Ok(BuildManifest {
            internal_port,
            build_file,
            origin: ManifestOrigin::Supplied,
        });
    }

    let facts = ProjectFacts::gather(project_path).await?;
    let template = select_template(&facts);
    info!(
        "Detected {} project at {}",
        template.spec().name,
        project_path.display()
    );
    Ok(BuildManifest::from_template(template))
}
