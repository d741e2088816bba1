/// Hashing descriptor vectors into small binary codes.
pub mod hasher;
/// Learning the mean vector and rotation used to hash descriptor vectors.
///
/// Implements the method described in Yunchao Gong and Svetlana Lazebnik, ['Iterative Quantization: A Procrustes Approach to Learning Binary Codes'](https://doi.org/10.1109/CVPR.2011.5995432), CVPR 2011.
pub mod trainer;
