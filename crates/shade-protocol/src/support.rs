//! Model of the per-header API-support file consumed by the code generator.
//!
//! The daemon only parses these files to validate hand-written stub tables
//! against the generator's view of each API; emitting the stubs themselves
//! is the generator's job.

use serde::{Deserialize, Serialize};

use crate::api::ApiKind;
use crate::resource::ResourceTypeId;

/// One support file describes every remoted API of a single vendor header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSupportFile {
    pub header_file_name: String,
    #[serde(default)]
    pub dependent_headers: Vec<String>,
    #[serde(default)]
    pub apis: Vec<ApiSupportEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSupportEntry {
    pub name: String,
    /// Hand-written parser/worker bodies instead of generated ones.
    #[serde(default)]
    pub customize: bool,
    #[serde(rename = "type")]
    pub kind: ApiKind,
    #[serde(default)]
    pub create_resources: Vec<ResourceEffect>,
    #[serde(default)]
    pub delete_resources: Vec<ResourceEffect>,
    #[serde(default)]
    pub get_resources: Vec<ResourceEffect>,
    #[serde(default)]
    pub set_resources: Vec<ResourceEffect>,
}

/// Binds a parameter index to the resource kind it creates/deletes/touches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceEffect {
    pub index: u16,
    #[serde(rename = "type")]
    pub resource: SupportResourceTag,
}

/// Resource tags as spelled in the support files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupportResourceTag {
    CudaMemory,
    CudaStream,
    CudaEvent,
    CudaModule,
    CudaFunction,
}

impl SupportResourceTag {
    pub fn resource_type(self) -> ResourceTypeId {
        match self {
            SupportResourceTag::CudaMemory => ResourceTypeId::Memory,
            SupportResourceTag::CudaStream => ResourceTypeId::Stream,
            SupportResourceTag::CudaEvent => ResourceTypeId::Event,
            SupportResourceTag::CudaModule => ResourceTypeId::Module,
            SupportResourceTag::CudaFunction => ResourceTypeId::Function,
        }
    }
}

impl ApiSupportFile {
    pub fn from_yaml(doc: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_support_document() {
        let doc = r#"
header_file_name: cuda_runtime_api.h
dependent_headers:
  - cuda.h
apis:
  - name: cudaMalloc
    customize: true
    type: create_resource
    create_resources:
      - index: 0
        type: cuda_memory
  - name: cudaStreamCreate
    type: create_resource
    create_resources:
      - index: 0
        type: cuda_stream
  - name: cudaModuleGetFunction
    type: get_resource
    get_resources:
      - index: 1
        type: cuda_module
    create_resources:
      - index: 0
        type: cuda_function
"#;
        let file = ApiSupportFile::from_yaml(doc).unwrap();
        assert_eq!(file.header_file_name, "cuda_runtime_api.h");
        assert_eq!(file.dependent_headers, vec!["cuda.h"]);
        assert_eq!(file.apis.len(), 3);
        assert!(file.apis[0].customize);
        assert_eq!(
            file.apis[0].create_resources[0].resource.resource_type(),
            ResourceTypeId::Memory
        );
        assert_eq!(
            file.apis[2].get_resources[0].resource.resource_type(),
            ResourceTypeId::Module
        );
        assert_eq!(
            file.apis[2].create_resources[0].resource.resource_type(),
            ResourceTypeId::Function
        );
    }
}
