use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};
use ndarray::{Array1, ArrayView1, Axis, concatenate};
use serde::{Deserialize, Serialize};

/// 特征提取参数，参与模型版本的计算
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureParams {
    /// 提取特征前统一缩放到的边长
    pub input_size: u32,
    /// 每个颜色通道的直方图区间数量
    pub histogram_bins: u32,
    /// 亮度网格的边长
    pub grid_size: u32,
    /// 颜色特征权重
    pub color_weight: f32,
    /// 结构特征权重
    pub structure_weight: f32,
}

impl Default for FeatureParams {
    fn default() -> Self {
        Self {
            input_size: 64,
            histogram_bins: 8,
            grid_size: 8,
            color_weight: 0.35,
            structure_weight: 0.65,
        }
    }
}

impl FeatureParams {
    /// 检查参数是否合法
    pub fn validate(&self) -> Result<(), String> {
        if !(2..=64).contains(&self.histogram_bins) {
            return Err(format!("histogram_bins 必须位于 2..=64: {}", self.histogram_bins));
        }
        if !(2..=32).contains(&self.grid_size) {
            return Err(format!("grid_size 必须位于 2..=32: {}", self.grid_size));
        }
        if self.input_size < self.grid_size || self.input_size > 1024 {
            return Err(format!("input_size 必须位于 grid_size..=1024: {}", self.input_size));
        }
        let weights = [self.color_weight, self.structure_weight];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) || weights.iter().sum::<f32>() <= 0.0 {
            return Err("特征权重必须为非负数且不能全为 0".to_string());
        }
        Ok(())
    }

    /// 嵌入向量维数
    pub fn dimension(&self) -> usize {
        (3 * self.histogram_bins + self.grid_size * self.grid_size) as usize
    }
}

/// 解码图片，统一转换为 RGB
pub fn decode(data: &[u8]) -> Result<RgbImage, image::ImageError> {
    Ok(image::load_from_memory(data)?.to_rgb8())
}

/// L2 归一化，向量模长接近 0 时返回 false 且不做修改
pub fn l2_normalize(v: &mut Array1<f32>) -> bool {
    let norm = v.dot(v).sqrt();
    if norm <= 1e-6 {
        return false;
    }
    v.mapv_inplace(|x| x / norm);
    true
}

/// RGB 三通道颜色直方图，已归一化
pub fn color_histogram(img: &RgbImage, bins: u32) -> Array1<f32> {
    let bins = bins as usize;
    let mut hist = Array1::<f32>::zeros(3 * bins);
    for pixel in img.pixels() {
        for (channel, value) in pixel.0.iter().enumerate() {
            let bin = *value as usize * bins / 256;
            hist[channel * bins + bin] += 1.0;
        }
    }
    l2_normalize(&mut hist);
    hist
}

/// 去均值后的亮度网格，已归一化
///
/// 纯色图片没有结构信息，此时返回均匀向量，保证相同图片的相似度仍为 1
pub fn luminance_grid(img: &RgbImage, grid: u32) -> Array1<f32> {
    let gray = DynamicImage::ImageRgb8(img.clone()).to_luma8();
    let small = imageops::resize(&gray, grid, grid, FilterType::Triangle);
    let mut v = Array1::from_iter(small.pixels().map(|p| p.0[0] as f32 / 255.0));
    let mean = v.mean().unwrap_or(0.0);
    v.mapv_inplace(|x| x - mean);
    if !l2_normalize(&mut v) {
        let n = v.len() as f32;
        v.fill(1.0 / n.sqrt());
    }
    v
}

/// 提取完整的嵌入向量，模长为 1
pub fn extract(img: &RgbImage, params: &FeatureParams) -> Vec<f32> {
    let size = params.input_size;
    let resized = imageops::resize(img, size, size, FilterType::Triangle);

    let total = params.color_weight + params.structure_weight;
    let color = color_histogram(&resized, params.histogram_bins) * (params.color_weight / total).sqrt();
    let structure =
        luminance_grid(&resized, params.grid_size) * (params.structure_weight / total).sqrt();

    let mut embedding = concatenate![Axis(0), color, structure];
    l2_normalize(&mut embedding);
    embedding.to_vec()
}

/// 颜色与结构两部分各自的余弦相似度
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComponentScores {
    pub color: f32,
    pub structure: f32,
}

fn segment_cosine(a: &[f32], b: &[f32]) -> f32 {
    let a = ArrayView1::from(a);
    let b = ArrayView1::from(b);
    let norm = (a.dot(&a) * b.dot(&b)).sqrt();
    if norm <= 1e-12 {
        return 0.0;
    }
    (a.dot(&b) / norm).clamp(-1.0, 1.0)
}

/// 按颜色直方图与亮度网格的边界拆开两个嵌入向量分别比较，维数不符时返回 `None`
///
/// 整体缩放不影响结果，已归一化的索引行也可以直接使用
pub fn component_similarity(a: &[f32], b: &[f32], params: &FeatureParams) -> Option<ComponentScores> {
    let dim = params.dimension();
    if a.len() != dim || b.len() != dim {
        return None;
    }
    let split = 3 * params.histogram_bins as usize;
    Some(ComponentScores {
        color: segment_cosine(&a[..split], &b[..split]),
        structure: segment_cosine(&a[split..], &b[split..]),
    })
}
