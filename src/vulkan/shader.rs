// Shader module and program cache
//
// Bytecode arrives as an opaque input; this cache turns it into
// VkShaderModules (deduplicated by code hash) and bundles the stages
// of each (program, permutation) pair with its reflection tables.

use ash::vk;

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::ffi::CString;
use std::hash::{Hash, Hasher};

use crate::types::*;
use crate::{Result, StratusError};

/// One compiled stage ready for pipeline creation.
pub struct ShaderStageModule {
    pub stage: vk::ShaderStageFlags,
    pub module: vk::ShaderModule,
    pub entry: CString,
}

/// A loaded shader program permutation.
pub struct VulkanShaderProgram {
    pub bind_point: vk::PipelineBindPoint,
    pub stages: Vec<ShaderStageModule>,
    pub reflection: Option<ShaderProgramReflection>,
}

/// Device-global cache of shader modules and programs. Append-only
/// for the device lifetime apart from explicit unloads.
pub struct ShaderCache {
    /// code hash -> module, shared across programs.
    modules: HashMap<u64, vk::ShaderModule>,
    programs: HashMap<(ShaderProgramId, ShaderPermutationId), VulkanShaderProgram>,
}

fn hash_code(code: &[u32]) -> u64 {
    let mut h = DefaultHasher::new();
    code.hash(&mut h);
    h.finish()
}

impl ShaderCache {
    pub fn new() -> Self {
        Self {
            modules: HashMap::new(),
            programs: HashMap::new(),
        }
    }

    fn module_for(&mut self, dev: &ash::Device, blob: &ShaderBlob) -> Result<vk::ShaderModule> {
        if blob.code.is_empty() {
            return Err(StratusError::INVALID_ARGS);
        }

        let key = hash_code(&blob.code);
        if let Some(module) = self.modules.get(&key) {
            return Ok(*module);
        }

        let info = vk::ShaderModuleCreateInfo::builder().code(&blob.code);
        let module = unsafe {
            dev.create_shader_module(&info, None).map_err(|e| {
                log::error!("[VK] Failed to create shader module: {:?}", e);
                StratusError::FAILED
            })?
        };

        self.modules.insert(key, module);
        Ok(module)
    }

    fn push_stage(
        &mut self,
        dev: &ash::Device,
        stages: &mut Vec<ShaderStageModule>,
        stage: vk::ShaderStageFlags,
        blob: &ShaderBlob,
    ) -> Result<()> {
        let module = self.module_for(dev, blob)?;
        stages.push(ShaderStageModule {
            stage,
            module,
            entry: CString::new(blob.entry.as_str()).map_err(|_| StratusError::INVALID_ARGS)?,
        });
        Ok(())
    }

    /// Load one (program, permutation). Reloading an existing pair
    /// replaces its definition.
    pub fn load(
        &mut self,
        dev: &ash::Device,
        program: ShaderProgramId,
        permutation: ShaderPermutationId,
        definition: &ShaderProgramDefinition,
    ) -> Result<()> {
        let loaded = match definition {
            ShaderProgramDefinition::Graphics {
                vs,
                ps,
                gs,
                hs,
                ds,
                reflection,
            } => {
                let mut stages = Vec::new();
                self.push_stage(dev, &mut stages, vk::ShaderStageFlags::VERTEX, vs)?;
                if let Some(ps) = ps {
                    self.push_stage(dev, &mut stages, vk::ShaderStageFlags::FRAGMENT, ps)?;
                }
                if let Some(gs) = gs {
                    self.push_stage(dev, &mut stages, vk::ShaderStageFlags::GEOMETRY, gs)?;
                }
                if let Some(hs) = hs {
                    self.push_stage(
                        dev,
                        &mut stages,
                        vk::ShaderStageFlags::TESSELLATION_CONTROL,
                        hs,
                    )?;
                }
                if let Some(ds) = ds {
                    self.push_stage(
                        dev,
                        &mut stages,
                        vk::ShaderStageFlags::TESSELLATION_EVALUATION,
                        ds,
                    )?;
                }
                VulkanShaderProgram {
                    bind_point: vk::PipelineBindPoint::GRAPHICS,
                    stages,
                    reflection: reflection.clone(),
                }
            }
            ShaderProgramDefinition::Compute { cs, reflection } => {
                let mut stages = Vec::new();
                self.push_stage(dev, &mut stages, vk::ShaderStageFlags::COMPUTE, cs)?;
                VulkanShaderProgram {
                    bind_point: vk::PipelineBindPoint::COMPUTE,
                    stages,
                    reflection: reflection.clone(),
                }
            }
        };

        self.programs.insert((program, permutation), loaded);
        Ok(())
    }

    pub fn get(
        &self,
        program: ShaderProgramId,
        permutation: ShaderPermutationId,
    ) -> Option<&VulkanShaderProgram> {
        self.programs.get(&(program, permutation))
    }

    /// Drop every permutation of `program`. Modules stay cached,
    /// they may be shared with other programs.
    pub fn unload(&mut self, program: ShaderProgramId) -> Result<()> {
        let before = self.programs.len();
        self.programs.retain(|(p, _), _| *p != program);
        if self.programs.len() == before {
            return Err(StratusError::NOT_FOUND);
        }
        Ok(())
    }

    /// Drop everything, destroying the native modules.
    pub fn unload_all(&mut self, dev: &ash::Device) {
        self.programs.clear();
        for (_, module) in self.modules.drain() {
            unsafe { dev.destroy_shader_module(module, None) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_hash_dedups_identical_blobs() {
        let a = vec![0x0723_0203u32, 1, 2, 3];
        let b = vec![0x0723_0203u32, 1, 2, 3];
        let c = vec![0x0723_0203u32, 1, 2, 4];
        assert_eq!(hash_code(&a), hash_code(&b));
        assert_ne!(hash_code(&a), hash_code(&c));
    }
}
