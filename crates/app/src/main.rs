//! vesta demo: a tinted triangle driven by the paced frame loop.
//!
//! Exercises every piece of the renderer once per frame: acquire with
//! swapchain recreation, a descriptor set built through the layout cache and
//! allocator, push constants, submit and present.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use bytemuck::{Pod, Zeroable};
use clap::Parser;
use glam::{Mat4, Vec3};
use tracing::{debug, info};

use vesta_core::config::PresentModeConfig;
use vesta_core::{EngineConfig, FrameTimer, OrFatal, init_logging};
use vesta_platform::{Window, WindowEvents};
use vesta_renderer::{FrameStatus, GpuContext, Renderer, RendererDesc};
use vesta_rhi::buffer::{Buffer, BufferUsage};
use vesta_rhi::descriptor::{DescriptorBuilder, DescriptorKind};
use vesta_rhi::device::Device;
use vesta_rhi::pipeline::{GraphicsPipelineBuilder, Pipeline, push_constant_range};
use vesta_rhi::shader::{Shader, ShaderStage};
use vesta_rhi::{LayoutHandle, RhiResult, vk};

#[derive(Parser, Debug)]
#[command(name = "vesta", version, about = "Frame-paced Vulkan triangle demo")]
struct Args {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides `renderer.frames_in_flight` (1 to 3).
    #[arg(short, long)]
    frames_in_flight: Option<u32>,

    /// Overrides `renderer.present_mode`.
    #[arg(short, long, value_parser = parse_present_mode)]
    present_mode: Option<PresentModeConfig>,
}

fn parse_present_mode(value: &str) -> std::result::Result<PresentModeConfig, String> {
    match value {
        "fifo" => Ok(PresentModeConfig::Fifo),
        "mailbox" => Ok(PresentModeConfig::Mailbox),
        "immediate" => Ok(PresentModeConfig::Immediate),
        other => Err(format!(
            "unknown present mode '{}' (expected fifo, mailbox or immediate)",
            other
        )),
    }
}

/// Position and color, matching `shaders/triangle.vert`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
struct TriangleVertex {
    position: Vec3,
    color: Vec3,
}

impl TriangleVertex {
    const fn new(position: Vec3, color: Vec3) -> Self {
        Self { position, color }
    }

    fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Self>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 2] {
        [
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 0,
            },
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 1,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: std::mem::size_of::<Vec3>() as u32,
            },
        ]
    }
}

const TRIANGLE: [TriangleVertex; 3] = [
    TriangleVertex::new(Vec3::new(0.0, -0.5, 0.0), Vec3::new(1.0, 0.0, 0.0)),
    TriangleVertex::new(Vec3::new(0.5, 0.5, 0.0), Vec3::new(0.0, 1.0, 0.0)),
    TriangleVertex::new(Vec3::new(-0.5, 0.5, 0.0), Vec3::new(0.0, 0.0, 1.0)),
];

/// Set 0, binding 0 of the vertex shader. Written once at startup.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct SceneUniforms {
    transform: Mat4,
}

fn tint_at(seconds: f32) -> [f32; 4] {
    let pulse = 0.75 + 0.25 * seconds.sin();
    [pulse, pulse, pulse, 1.0]
}

fn build_pipeline(
    device: &Arc<Device>,
    vertex_shader: &Shader,
    fragment_shader: &Shader,
    scene_layout: LayoutHandle,
    render_pass: vk::RenderPass,
) -> RhiResult<Pipeline> {
    GraphicsPipelineBuilder::new()
        .vertex_shader(vertex_shader)
        .fragment_shader(fragment_shader)
        .vertex_binding(TriangleVertex::binding_description())
        .vertex_attributes(&TriangleVertex::attribute_descriptions())
        .set_layout(scene_layout)
        .push_constant_range(push_constant_range::<[f32; 4]>(
            vk::ShaderStageFlags::VERTEX,
            0,
        ))
        .render_pass(render_pass)
        .build(device.clone())
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    let mut config = EngineConfig::load(args.config.as_deref())?;
    if let Some(frames) = args.frames_in_flight {
        config.renderer.frames_in_flight = frames;
    }
    if let Some(mode) = args.present_mode {
        config.renderer.present_mode = mode;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();

    let config = load_config(&args).or_fatal("load configuration");
    info!(
        "Starting vesta ({} frames in flight, {:?} present mode)",
        config.renderer.frames_in_flight, config.renderer.present_mode
    );

    let mut window = Window::new(&config.window).or_fatal("create window");
    let context = GpuContext::new(&window, &config.window.title, config.renderer.validation)
        .or_fatal("create GPU context");
    let mut renderer = Renderer::new(
        context.driver(),
        window.extent(),
        &RendererDesc::from_config(&config),
    )
    .or_fatal("create renderer");

    let device = context.device().clone();

    let vertex_buffer = Buffer::with_data(device.clone(), BufferUsage::Vertex, &TRIANGLE)
        .or_fatal("upload vertices");
    let uniforms = SceneUniforms {
        transform: Mat4::from_scale(Vec3::splat(1.2)),
    };
    let uniform_buffer = Buffer::with_data(device.clone(), BufferUsage::Uniform, &[uniforms])
        .or_fatal("upload uniforms");

    let (scene_set, scene_layout) = {
        let (cache, allocator) = renderer.descriptors();
        DescriptorBuilder::new()
            .bind_buffer(
                0,
                DescriptorKind::UniformBuffer,
                vk::ShaderStageFlags::VERTEX,
                uniform_buffer.binding(),
            )
            .build(cache, allocator)
            .or_fatal("build scene descriptor set")
    };

    let vertex_shader = Shader::from_spirv_file(
        device.clone(),
        &config.shaders.vertex,
        ShaderStage::Vertex,
        "main",
    )
    .or_fatal("load vertex shader");
    let fragment_shader = Shader::from_spirv_file(
        device.clone(),
        &config.shaders.fragment,
        ShaderStage::Fragment,
        "main",
    )
    .or_fatal("load fragment shader");

    let mut pipeline = build_pipeline(
        &device,
        &vertex_shader,
        &fragment_shader,
        scene_layout,
        renderer.render_target().render_pass(),
    )
    .or_fatal("build pipeline");
    let mut pipeline_pass = renderer.render_target().render_pass_generation();

    info!("Initialization complete, entering main loop");

    let mut timer = FrameTimer::new();
    while !window.should_close() {
        window.poll_events();

        let Some(frame) = renderer.begin_frame(&mut window).or_fatal("begin frame") else {
            continue;
        };

        if renderer.render_target().render_pass_generation() != pipeline_pass {
            // The pass only changes during recreation, which idled the device.
            pipeline = build_pipeline(
                &device,
                &vertex_shader,
                &fragment_shader,
                scene_layout,
                renderer.render_target().render_pass(),
            )
            .or_fatal("rebuild pipeline");
            pipeline_pass = renderer.render_target().render_pass_generation();
        }

        let tint = tint_at(timer.elapsed().as_secs_f32());
        let list = renderer
            .begin_render_pass(&frame, pipeline.handle())
            .or_fatal("begin render pass");
        list.bind_descriptor_sets(pipeline.layout(), 0, &[scene_set]);
        list.push_constants(pipeline.layout(), vk::ShaderStageFlags::VERTEX, 0, &tint);
        list.bind_vertex_buffers(0, &[vertex_buffer.handle()], &[0]);
        list.draw(TRIANGLE.len() as u32, 1, 0, 0);

        match renderer.end_frame(frame).or_fatal("end frame") {
            FrameStatus::Success => {}
            status => debug!("Present returned {:?}, swapchain will be recreated", status),
        }

        if let (_, Some(fps)) = timer.tick() {
            window.set_title(&format!("{} ({:.0} fps)", config.window.title, fps));
        }
    }

    info!(
        "Shutting down after {} frames",
        renderer.frames().frames_presented()
    );
    renderer.wait_idle().or_fatal("wait for device idle");

    // GPU objects go before the renderer that owns their layouts, and the
    // renderer before the context that owns the device.
    drop(pipeline);
    drop(fragment_shader);
    drop(vertex_shader);
    drop(uniform_buffer);
    drop(vertex_buffer);
    drop(device);
    drop(renderer);
    drop(context);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_layout_matches_struct() {
        let binding = TriangleVertex::binding_description();
        assert_eq!(binding.stride, 24);
        let attributes = TriangleVertex::attribute_descriptions();
        assert_eq!(attributes[1].offset, 12);
    }

    #[test]
    fn test_present_mode_parsing() {
        assert_eq!(parse_present_mode("mailbox"), Ok(PresentModeConfig::Mailbox));
        assert!(parse_present_mode("vsync").is_err());
    }

    #[test]
    fn test_cli_overrides_config() {
        let args = Args::parse_from([
            "vesta",
            "--frames-in-flight",
            "3",
            "--present-mode",
            "immediate",
        ]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.renderer.frames_in_flight, 3);
        assert_eq!(config.renderer.present_mode, PresentModeConfig::Immediate);
    }

    #[test]
    fn test_cli_rejects_too_many_frames() {
        let args = Args::parse_from(["vesta", "--frames-in-flight", "4"]);
        assert!(load_config(&args).is_err());
    }

    #[test]
    fn test_tint_stays_in_range() {
        for step in 0..100 {
            let tint = tint_at(step as f32 * 0.1);
            assert!((0.5..=1.0).contains(&tint[0]));
            assert_eq!(tint[3], 1.0);
        }
    }
}
